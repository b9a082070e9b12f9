//! Nmap invocation and XML report parsing

use super::ServiceFinding;
use crate::{Result, ScanError};
use serde::Deserialize;
use std::net::IpAddr;

/// Connect scan with version detection over the fast port list
pub fn arguments(ip: IpAddr) -> Vec<String> {
    let mut args: Vec<String> = [
        "-sT",
        "-sV",
        "-F",
        "-T3",
        "--max-retries",
        "2",
        "--host-timeout",
        "300s",
        "-oX",
        "-",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    if ip.is_ipv6() {
        args.push("-6".to_string());
    }
    args.push(ip.to_string());
    args
}

#[derive(Debug, Deserialize)]
struct NmapRun {
    #[serde(rename = "host", default)]
    hosts: Vec<Host>,
}

#[derive(Debug, Deserialize)]
struct Host {
    ports: Option<Ports>,
}

#[derive(Debug, Deserialize)]
struct Ports {
    #[serde(rename = "port", default)]
    ports: Vec<XmlPort>,
}

#[derive(Debug, Deserialize)]
struct XmlPort {
    #[serde(rename = "@protocol")]
    protocol: String,
    #[serde(rename = "@portid")]
    portid: u16,
    state: XmlState,
    service: Option<XmlService>,
}

#[derive(Debug, Deserialize)]
struct XmlState {
    #[serde(rename = "@state")]
    state: String,
}

#[derive(Debug, Deserialize)]
struct XmlService {
    #[serde(rename = "@name")]
    name: Option<String>,
    #[serde(rename = "@product")]
    product: Option<String>,
    #[serde(rename = "@version")]
    version: Option<String>,
}

/// Open ports from an `-oX` report
pub fn parse_xml(xml: &str) -> Result<Vec<ServiceFinding>> {
    let run: NmapRun = quick_xml::de::from_str(xml)
        .map_err(|e| ScanError::Tool(format!("unreadable nmap XML: {}", e)))?;

    Ok(run
        .hosts
        .into_iter()
        .filter_map(|h| h.ports)
        .flat_map(|p| p.ports)
        .filter(|p| p.state.state == "open")
        .map(|p| {
            let service = p.service;
            ServiceFinding {
                port: p.portid,
                protocol: p.protocol,
                service: service.as_ref().and_then(|s| s.name.clone()),
                product: service.as_ref().and_then(|s| s.product.clone()),
                version: service.and_then(|s| s.version),
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<nmaprun scanner="nmap" args="nmap -sT -sV -F -oX - 192.0.2.10" version="7.94">
<host starttime="1700000000" endtime="1700000010">
<status state="up" reason="conn-refused"/>
<address addr="192.0.2.10" addrtype="ipv4"/>
<ports>
<port protocol="tcp" portid="22"><state state="open" reason="syn-ack"/><service name="ssh" product="OpenSSH" version="8.9p1" method="probed" conf="10"/></port>
<port protocol="tcp" portid="80"><state state="closed" reason="conn-refused"/></port>
<port protocol="tcp" portid="443"><state state="open" reason="syn-ack"/><service name="https" method="table" conf="3"/></port>
</ports>
</host>
</nmaprun>"#;

    #[test]
    fn open_ports_are_extracted() {
        let ports = parse_xml(REPORT).unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port, 22);
        assert_eq!(ports[0].product.as_deref(), Some("OpenSSH"));
        assert_eq!(ports[0].version.as_deref(), Some("8.9p1"));
        assert_eq!(ports[1].service.as_deref(), Some("https"));
        assert!(ports[1].version.is_none());
    }

    #[test]
    fn host_without_ports_is_empty() {
        let ports = parse_xml(r#"<nmaprun><host><status state="down"/></host></nmaprun>"#).unwrap();
        assert!(ports.is_empty());
    }

    #[test]
    fn garbage_is_tool_error() {
        let bad_port = r#"<nmaprun><host><ports><port protocol="tcp" portid="ssh"><state state="open"/></port></ports></host></nmaprun>"#;
        assert!(matches!(parse_xml(bad_port), Err(ScanError::Tool(_))));
    }

    #[test]
    fn ipv6_targets_get_flag() {
        let args = arguments("2001:db8::1".parse().unwrap());
        assert!(args.contains(&"-6".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("2001:db8::1"));
    }
}
