// SPDX-License-Identifier: BSD-3-Clause

//! Shared server configuration, grounded in `FtpConfig`. The original guards
//! this with a platform mutex held only across getter/setter calls; the
//! direct translation is a plain struct behind `Arc<Mutex<Config>>`.

use std::io;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
pub struct Config {
    user: String,
    pass: String,
    port: u16,
    get_mtime: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: String::new(),
            pass: String::new(),
            port: 5000,
            get_mtime: true,
        }
    }
}

impl Config {
    pub fn new(user: String, pass: String, port: u16) -> Self {
        Self {
            user,
            pass,
            port,
            get_mtime: true,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn pass(&self) -> &str {
        &self.pass
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn get_mtime(&self) -> bool {
        self.get_mtime
    }

    pub fn set_user(&mut self, user: String) {
        self.user = user;
    }

    pub fn set_pass(&mut self, pass: String) {
        self.pass = pass;
    }

    /// Parse and set the listen port. Returns `false` on a malformed value,
    /// mirroring `FtpConfig::setPort(std::string const&)`.
    pub fn set_port_str(&mut self, port: &str) -> bool {
        match port.parse::<u16>() {
            Ok(p) => {
                self.port = p;
                true
            }
            Err(_) => false,
        }
    }

    pub fn set_get_mtime(&mut self, get_mtime: bool) {
        self.get_mtime = get_mtime;
    }

    /// Load from a flat `key = value` file. Unknown/missing keys keep their
    /// default. Matches the teacher's practice of avoiding a heavyweight
    /// config format when a handful of scalar fields are all that's needed.
    pub fn load(path: &str) -> io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut cfg = Config::default();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim();
                match key {
                    "user" => cfg.user = value.to_string(),
                    "pass" => cfg.pass = value.to_string(),
                    "port" => {
                        if let Ok(p) = value.parse() {
                            cfg.port = p;
                        }
                    }
                    "get_mtime" => cfg.get_mtime = value == "true",
                    _ => {}
                }
            }
        }
        Ok(cfg)
    }

    /// Persist as flat `key = value` lines, used by `SITE SAVE`.
    pub fn save(&self, path: &str) -> io::Result<()> {
        let contents = format!(
            "user = {}\npass = {}\nport = {}\nget_mtime = {}\n",
            self.user, self.pass, self.port, self.get_mtime
        );
        std::fs::write(path, contents)
    }
}

pub type SharedConfig = Arc<Mutex<Config>>;

pub fn shared(config: Config) -> SharedConfig {
    Arc::new(Mutex::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn set_port_str_rejects_non_numeric() {
        let mut cfg = Config::default();
        assert!(!cfg.set_port_str("not-a-port"));
        assert_eq!(cfg.port(), 5000);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ftpd.conf");
        let path = path.to_str().unwrap();

        let mut cfg = Config::default();
        cfg.set_user("anon".to_string());
        cfg.set_pass("secret".to_string());
        cfg.set_port_str("2121");
        cfg.save(path).unwrap();

        let loaded = Config::load(path).unwrap();
        assert_eq!(loaded.user(), "anon");
        assert_eq!(loaded.pass(), "secret");
        assert_eq!(loaded.port(), 2121);
    }
}
