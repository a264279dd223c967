use std::sync::Arc;

use crate::exit::{ActiveGuard, Exit, LoginReservation};

/// A picked exit together with the capacity reserved on it.
///
/// `active` stays incremented until the selection is dropped. A login
/// reservation is returned to the exit unless it is confirmed.
#[derive(Debug)]
pub struct Selection {
    exit: Arc<Exit>,
    _guard: ActiveGuard,
    reservation: Option<LoginReservation>,
}

impl Selection {
    pub(crate) fn new(guard: ActiveGuard, reservation: Option<LoginReservation>) -> Self {
        Self {
            exit: guard.exit().clone(),
            _guard: guard,
            reservation,
        }
    }

    pub fn exit(&self) -> &Arc<Exit> {
        &self.exit
    }

    pub fn is_direct(&self) -> bool {
        self.exit.is_direct()
    }

    pub fn has_login_reservation(&self) -> bool {
        self.reservation.is_some()
    }

    /// Move the reserved login into the exit's login window, or count it
    /// as over quota when the pick carried no reservation
    pub fn confirm_login(&mut self) {
        match self.reservation.take() {
            Some(reservation) => reservation.confirm(),
            None => self.exit.record_login_over_quota(),
        }
    }
}
