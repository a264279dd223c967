//! sing-box configuration rendering
//!
//! One SOCKS inbound on `127.0.0.1:<port>` and one outbound built from the
//! node's protocol parameters.

use serde_json::{json, Map, Value};

use crate::error::Result;
use crate::models::{Node, NodeParams, TlsOptions, Transport};

const OUTBOUND_TAG: &str = "proxy";

/// Render the full tunnel config for `node` listening on `port`
pub fn render(node: &Node, port: u16) -> Result<Value> {
    node.validate()?;

    Ok(json!({
        "log": { "level": "warn", "timestamp": true },
        "inbounds": [{
            "type": "socks",
            "tag": format!("socks-in-{}", port),
            "listen": "127.0.0.1",
            "listen_port": port,
        }],
        "outbounds": [outbound(node)],
    }))
}

fn outbound(node: &Node) -> Value {
    let mut out = Map::new();
    out.insert("tag".into(), OUTBOUND_TAG.into());
    out.insert("server".into(), node.host.clone().into());
    out.insert("server_port".into(), node.port.into());

    match &node.params {
        NodeParams::Vless {
            uuid,
            flow,
            tls,
            transport,
        } => {
            out.insert("type".into(), "vless".into());
            out.insert("uuid".into(), uuid.clone().into());
            if let Some(flow) = flow.as_deref().filter(|f| !f.is_empty()) {
                out.insert("flow".into(), flow.into());
            }
            insert_tls(&mut out, tls.as_ref(), &node.host);
            insert_transport(&mut out, transport.as_ref());
        }
        NodeParams::Vmess {
            uuid,
            alter_id,
            security,
            tls,
            transport,
        } => {
            out.insert("type".into(), "vmess".into());
            out.insert("uuid".into(), uuid.clone().into());
            out.insert("alter_id".into(), (*alter_id).into());
            out.insert(
                "security".into(),
                security.as_deref().unwrap_or("auto").into(),
            );
            insert_tls(&mut out, tls.as_ref(), &node.host);
            insert_transport(&mut out, transport.as_ref());
        }
        NodeParams::Trojan {
            password,
            tls,
            transport,
        } => {
            out.insert("type".into(), "trojan".into());
            out.insert("password".into(), password.clone().into());
            // trojan always runs over TLS
            match tls {
                Some(tls) if tls.enabled => insert_tls(&mut out, Some(tls), &node.host),
                _ => {
                    out.insert(
                        "tls".into(),
                        json!({ "enabled": true, "server_name": node.host }),
                    );
                }
            }
            insert_transport(&mut out, transport.as_ref());
        }
        NodeParams::Shadowsocks { method, password } => {
            out.insert("type".into(), "shadowsocks".into());
            out.insert("method".into(), method.clone().into());
            out.insert("password".into(), password.clone().into());
        }
        NodeParams::Hysteria2 {
            password,
            sni,
            insecure,
            obfs,
            obfs_password,
        } => {
            out.insert("type".into(), "hysteria2".into());
            out.insert("password".into(), password.clone().into());
            out.insert("tls".into(), quic_tls(sni.as_deref(), &node.host, *insecure));
            if let Some(obfs) = obfs.as_deref().filter(|o| !o.is_empty()) {
                out.insert(
                    "obfs".into(),
                    json!({
                        "type": obfs,
                        "password": obfs_password.clone().unwrap_or_default(),
                    }),
                );
            }
        }
        NodeParams::Hysteria { auth, sni } => {
            out.insert("type".into(), "hysteria".into());
            out.insert("auth_str".into(), auth.clone().into());
            out.insert("tls".into(), quic_tls(sni.as_deref(), &node.host, true));
        }
        NodeParams::Tuic {
            uuid,
            password,
            sni,
        } => {
            out.insert("type".into(), "tuic".into());
            out.insert("uuid".into(), uuid.clone().into());
            out.insert("password".into(), password.clone().into());
            out.insert("tls".into(), quic_tls(sni.as_deref(), &node.host, true));
        }
    }

    Value::Object(out)
}

fn insert_tls(out: &mut Map<String, Value>, tls: Option<&TlsOptions>, host: &str) {
    let Some(tls) = tls.filter(|t| t.enabled) else {
        return;
    };

    let mut value = Map::new();
    value.insert("enabled".into(), true.into());
    value.insert(
        "server_name".into(),
        tls.server_name.as_deref().unwrap_or(host).into(),
    );
    if tls.insecure {
        value.insert("insecure".into(), true.into());
    }

    // reality needs a uTLS fingerprint even when none was given
    let fingerprint = match (&tls.fingerprint, &tls.reality) {
        (Some(fp), _) if !fp.is_empty() => Some(fp.as_str()),
        (_, Some(_)) => Some("chrome"),
        _ => None,
    };
    if let Some(fp) = fingerprint {
        value.insert("utls".into(), json!({ "enabled": true, "fingerprint": fp }));
    }
    if let Some(reality) = &tls.reality {
        value.insert(
            "reality".into(),
            json!({
                "enabled": true,
                "public_key": reality.public_key,
                "short_id": reality.short_id,
            }),
        );
    }

    out.insert("tls".into(), Value::Object(value));
}

fn insert_transport(out: &mut Map<String, Value>, transport: Option<&Transport>) {
    let value = match transport {
        None | Some(Transport::Tcp) => return,
        Some(Transport::Ws { path, host }) => {
            let mut ws = json!({ "type": "ws", "path": path });
            if let Some(host) = host.as_deref().filter(|h| !h.is_empty()) {
                ws["headers"] = json!({ "Host": host });
            }
            ws
        }
        Some(Transport::Grpc { service_name }) => {
            json!({ "type": "grpc", "service_name": service_name })
        }
        Some(Transport::Http { path, host }) => {
            let mut http = json!({ "type": "http" });
            if let Some(path) = path.as_deref().filter(|p| !p.is_empty()) {
                http["path"] = path.into();
            }
            if let Some(host) = host.as_deref().filter(|h| !h.is_empty()) {
                http["host"] = json!([host]);
            }
            http
        }
    };
    out.insert("transport".into(), value);
}

fn quic_tls(sni: Option<&str>, host: &str, insecure: bool) -> Value {
    json!({
        "enabled": true,
        "server_name": sni.filter(|s| !s.is_empty()).unwrap_or(host),
        "insecure": insecure,
    })
}
