use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::message::{RuleAction, RuleDir, Transport};
use crate::registry::{Entity, ObjectId};
use crate::secret::SecretBuf;

pub const CONF_FILE: &str = "/etc/wardend.conf";
pub const WARDEN_SOCKET: &str = "/var/run/wardend.sock";
pub const WARDEN_USER: &str = "_warden";
pub const DEFAULT_PREFORK: u32 = 5;
pub const PREFORK_MAX: u32 = 32;

pub const OPT_VERBOSE: u32 = 0x01;
pub const OPT_NOACTION: u32 = 0x02;
pub const OPT_LOGUPDATE: u32 = 0x04;

pub const F_TLS: u32 = 0x01;

fn default_prefork() -> u32 {
    DEFAULT_PREFORK
}

fn default_user() -> String {
    WARDEN_USER.to_string()
}

fn default_socket() -> PathBuf {
    PathBuf::from(WARDEN_SOCKET)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Host {
    #[serde(default)]
    pub id: ObjectId,
    pub name: String,
}

impl Entity for Host {
    fn id(&self) -> ObjectId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Table {
    #[serde(default)]
    pub id: ObjectId,
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub check_script: Option<PathBuf>,
}

impl Entity for Table {
    fn id(&self) -> ObjectId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Rdr {
    #[serde(default)]
    pub id: ObjectId,
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub table_id: ObjectId,
}

impl Entity for Rdr {
    fn id(&self) -> ObjectId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Router {
    #[serde(default)]
    pub id: ObjectId,
    pub name: String,
    #[serde(default)]
    pub gateways: Vec<String>,
}

impl Entity for Router {
    fn id(&self) -> ObjectId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub id: ObjectId,
    #[serde(default = "default_rule_dir")]
    pub dir: RuleDir,
    pub action: RuleAction,
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

fn default_rule_dir() -> RuleDir {
    RuleDir::Request
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Protocol {
    #[serde(default)]
    pub id: ObjectId,
    pub name: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Entity for Protocol {
    fn id(&self) -> ObjectId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Relay {
    #[serde(default)]
    pub id: ObjectId,
    pub name: String,
    pub listen: SocketAddr,
    #[serde(default = "default_transport")]
    pub transport: Transport,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub protocol_id: Option<ObjectId>,
    #[serde(default)]
    pub tls: Option<TlsPaths>,
    #[serde(default)]
    pub tls_keyid: Option<ObjectId>,
    /// Loaded lazily right before config distribution, never inherited
    /// across fork.
    #[serde(skip)]
    pub tls_cert: Option<Vec<u8>>,
    #[serde(skip)]
    pub tls_key: Option<SecretBuf>,
}

fn default_transport() -> Transport {
    Transport::Tcp
}

impl Entity for Relay {
    fn id(&self) -> ObjectId {
        self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_prefork")]
    pub prefork: u32,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_socket")]
    pub socket: PathBuf,
    #[serde(default)]
    pub pidfile: Option<PathBuf>,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub rdrs: Vec<Rdr>,
    #[serde(default)]
    pub routers: Vec<Router>,
    #[serde(default)]
    pub protocols: Vec<Protocol>,
    #[serde(default)]
    pub relays: Vec<Relay>,
    #[serde(default)]
    pub opts: u32,
}

impl Config {
    pub fn flags(&self) -> u32 {
        if self.relays.iter().any(|r| r.tls.is_some()) {
            F_TLS
        } else {
            0
        }
    }

    /// Read the TLS cert and key files of every relay. Kept separate from
    /// [`load`] so key material only ever exists in the parent, after the
    /// workers have been forked.
    pub fn load_keys(&mut self) -> Result<()> {
        for relay in &mut self.relays {
            let Some(tls) = &relay.tls else { continue };
            relay.tls_cert = Some(
                std::fs::read(&tls.cert)
                    .with_context(|| format!("relay {}: read {}", relay.name, tls.cert.display()))?,
            );
            relay.tls_key = Some(SecretBuf::new(std::fs::read(&tls.key).with_context(
                || format!("relay {}: read {}", relay.name, tls.key.display()),
            )?));
            debug!(relay = %relay.name, "loaded tls credentials");
        }
        Ok(())
    }

    /// Scrub and drop any key material still held.
    pub fn purge_keys(&mut self) {
        for relay in &mut self.relays {
            if let Some(key) = &mut relay.tls_key {
                key.purge();
            }
            relay.tls_key = None;
        }
    }
}

/// Load and validate a configuration file. `macros` are the `-D
/// name=value` definitions; `${name}` occurrences in the file text are
/// replaced before parsing.
pub fn load(path: &Path, macros: &[(String, String)], opts: u32) -> Result<Config> {
    let mut text = std::fs::read_to_string(path)
        .with_context(|| format!("config file {}", path.display()))?;
    for (name, value) in macros {
        text = text.replace(&format!("${{{name}}}"), value);
    }

    let mut cfg: Config =
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    cfg.opts |= opts;

    if cfg.prefork == 0 || cfg.prefork > PREFORK_MAX {
        bail!("prefork {} out of range (1-{})", cfg.prefork, PREFORK_MAX);
    }

    // parent-assigned object ids, unique across every entity kind
    let mut next_id: ObjectId = 0;
    let mut fresh = || {
        next_id += 1;
        next_id
    };

    for table in &mut cfg.tables {
        table.id = fresh();
        for host in &mut table.hosts {
            host.id = fresh();
            host.name = canonicalize_host(&host.name)
                .with_context(|| format!("table {}: bad host {}", table.name, host.name))?;
        }
    }
    for rdr in &mut cfg.rdrs {
        rdr.id = fresh();
        let table = cfg
            .tables
            .iter()
            .find(|t| t.name == rdr.table)
            .with_context(|| format!("rdr {}: unknown table {}", rdr.name, rdr.table))?;
        rdr.table_id = table.id;
    }
    for router in &mut cfg.routers {
        router.id = fresh();
    }
    for proto in &mut cfg.protocols {
        proto.id = fresh();
        for rule in &mut proto.rules {
            rule.id = fresh();
        }
    }
    for relay in &mut cfg.relays {
        relay.id = fresh();
        if let Some(name) = &relay.protocol {
            let proto = cfg
                .protocols
                .iter()
                .find(|p| &p.name == name)
                .with_context(|| format!("relay {}: unknown protocol {}", relay.name, name))?;
            relay.protocol_id = Some(proto.id);
        }
        if relay.tls.is_some() {
            relay.tls_keyid = Some(fresh());
        }
    }

    Ok(cfg)
}

/// Lower-case a hostname, squeeze repeated dots and strip trailing ones;
/// IP literals pass through untouched.
pub fn canonicalize_host(host: &str) -> Result<String> {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return Ok(host.to_string());
    }

    let mut name = String::with_capacity(host.len());
    for c in host.chars() {
        let c = c.to_ascii_lowercase();
        if c == '.' && (name.is_empty() || name.ends_with('.')) {
            continue;
        }
        name.push(c);
    }
    while name.ends_with('.') {
        name.pop();
    }
    if name.is_empty() {
        bail!("empty hostname");
    }
    Ok(name)
}

/// Printable prefix of an untrusted byte payload.
pub fn get_string(data: &[u8]) -> String {
    let end = data
        .iter()
        .position(|b| !(b.is_ascii_graphic() || b.is_ascii_whitespace()))
        .unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "prefork": 2,
        "tables": [
            { "name": "webhosts", "check_script": "/usr/local/bin/check",
              "hosts": [ { "name": "Web1.Example.COM." }, { "name": "10.0.0.2" } ] }
        ],
        "rdrs": [ { "name": "web", "table": "webhosts" } ],
        "protocols": [
            { "name": "http", "rules": [
                { "action": "Set", "key": "X-Forwarded-For", "value": "$REMOTE_ADDR" }
            ] }
        ],
        "relays": [
            { "name": "front", "listen": "127.0.0.1:${port}", "protocol": "http" }
        ]
    }"#;

    fn write_sample() -> temppath::TempPath {
        temppath::write(SAMPLE)
    }

    // minimal named-temp-file helper for config loader tests
    mod temppath {
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicUsize, Ordering};

        static SEQ: AtomicUsize = AtomicUsize::new(0);

        pub struct TempPath(pub PathBuf);

        impl Drop for TempPath {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.0);
            }
        }

        pub fn write(text: &str) -> TempPath {
            let path = std::env::temp_dir().join(format!(
                "wardend-test-{}-{}.conf",
                std::process::id(),
                SEQ.fetch_add(1, Ordering::Relaxed)
            ));
            std::fs::write(&path, text).unwrap();
            TempPath(path)
        }
    }

    #[test]
    fn load_assigns_unique_ids_and_resolves_names() {
        let file = write_sample();
        let cfg = load(
            &file.0,
            &[("port".to_string(), "8080".to_string())],
            OPT_VERBOSE,
        )
        .unwrap();

        assert_eq!(cfg.prefork, 2);
        assert_eq!(cfg.opts & OPT_VERBOSE, OPT_VERBOSE);
        assert_eq!(cfg.relays[0].listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(
            cfg.relays[0].protocol_id,
            Some(cfg.protocols[0].id),
            "protocol reference resolves to the protocol's id"
        );
        assert_eq!(cfg.rdrs[0].table_id, cfg.tables[0].id);
        // hostnames canonicalized at load time
        assert_eq!(cfg.tables[0].hosts[0].name, "web1.example.com");
        assert_eq!(cfg.tables[0].hosts[1].name, "10.0.0.2");

        let mut seen = HashSet::new();
        for id in [
            cfg.tables[0].id,
            cfg.tables[0].hosts[0].id,
            cfg.tables[0].hosts[1].id,
            cfg.rdrs[0].id,
            cfg.protocols[0].id,
            cfg.protocols[0].rules[0].id,
            cfg.relays[0].id,
        ] {
            assert!(id != 0);
            assert!(seen.insert(id), "duplicate id {id}");
        }
    }

    #[test]
    fn unknown_table_reference_fails() {
        let file = temppath::write(
            r#"{ "rdrs": [ { "name": "web", "table": "nosuch" } ] }"#,
        );
        assert!(load(&file.0, &[], 0).is_err());
    }

    #[test]
    fn prefork_bounds_are_enforced() {
        let file = temppath::write(r#"{ "prefork": 0 }"#);
        assert!(load(&file.0, &[], 0).is_err());
        let file = temppath::write(r#"{ "prefork": 64 }"#);
        assert!(load(&file.0, &[], 0).is_err());
    }

    #[test]
    fn missing_file_fails() {
        assert!(load(Path::new("/nonexistent/wardend.conf"), &[], 0).is_err());
    }

    #[test]
    fn canonicalize_host_cases() {
        assert_eq!(canonicalize_host("WWW..Example.Org.").unwrap(), "www.example.org");
        assert_eq!(canonicalize_host("192.168.0.1").unwrap(), "192.168.0.1");
        assert_eq!(canonicalize_host("::1").unwrap(), "::1");
        assert!(canonicalize_host("...").is_err());
    }

    #[test]
    fn get_string_stops_at_unprintable() {
        assert_eq!(get_string(b"reload /etc/a.conf\x00junk"), "reload /etc/a.conf");
        assert_eq!(get_string(b""), "");
    }

    #[test]
    fn purge_keys_scrubs_material() {
        let mut cfg = Config {
            prefork: 1,
            user: default_user(),
            socket: default_socket(),
            pidfile: None,
            tables: vec![],
            rdrs: vec![],
            routers: vec![],
            protocols: vec![],
            relays: vec![Relay {
                id: 1,
                name: "front".into(),
                listen: "127.0.0.1:443".parse().unwrap(),
                transport: Transport::Tcp,
                protocol: None,
                protocol_id: None,
                tls: None,
                tls_keyid: Some(2),
                tls_cert: None,
                tls_key: Some(SecretBuf::new(b"KEYDATA".to_vec())),
            }],
            opts: 0,
        };
        cfg.purge_keys();
        assert!(cfg.relays[0].tls_key.is_none());
    }

    #[test]
    fn flags_reports_tls() {
        let file = write_sample();
        let mut cfg = load(&file.0, &[("port".into(), "80".into())], 0).unwrap();
        assert_eq!(cfg.flags(), 0);
        cfg.relays[0].tls = Some(TlsPaths {
            cert: "/tmp/c.pem".into(),
            key: "/tmp/k.pem".into(),
        });
        assert_eq!(cfg.flags(), F_TLS);
    }

    #[test]
    fn load_keys_reads_files() {
        let mut cert = std::env::temp_dir().join(format!("wardend-cert-{}", std::process::id()));
        let mut key = cert.clone();
        cert.set_extension("crt");
        key.set_extension("key");
        std::fs::File::create(&cert)
            .unwrap()
            .write_all(b"CERT")
            .unwrap();
        std::fs::File::create(&key)
            .unwrap()
            .write_all(b"KEY")
            .unwrap();

        let file = write_sample();
        let mut cfg = load(&file.0, &[("port".into(), "80".into())], 0).unwrap();
        cfg.relays[0].tls = Some(TlsPaths {
            cert: cert.clone(),
            key: key.clone(),
        });
        cfg.load_keys().unwrap();
        assert_eq!(cfg.relays[0].tls_cert.as_deref(), Some(b"CERT".as_slice()));
        assert_eq!(cfg.relays[0].tls_key.as_ref().unwrap().as_slice(), b"KEY");

        let _ = std::fs::remove_file(cert);
        let _ = std::fs::remove_file(key);
    }
}
