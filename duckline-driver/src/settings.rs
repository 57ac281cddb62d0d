//! Persisted key=value settings.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

const DEFAULTS: &[(&str, &str)] = &[
    ("autorun", ""),
    ("channel", "1"),
    ("password", "quackquack"),
    ("sd_ack_timeout", "5000"),
    ("ssid", "duckline"),
];

pub struct Settings {
    path: PathBuf,
    map: BTreeMap<String, String>,
}

impl Settings {
    /// Load settings from `path`, filling gaps with the defaults.
    pub fn load(path: PathBuf) -> Self {
        let mut map: BTreeMap<String, String> = DEFAULTS
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect();
        if let Ok(contents) = fs::read_to_string(&path) {
            for line in contents.lines() {
                if let Some((key, value)) = line.split_once('=') {
                    map.insert(key.trim().to_string(), value.trim().to_string());
                }
            }
        }
        Settings { path, map }
    }

    fn save(&self) -> io::Result<()> {
        let mut out = String::new();
        for (key, value) in &self.map {
            out.push_str(&format!("{}={}\n", key, value));
        }
        fs::write(&self.path, out)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    /// Integer accessor with a fallback for missing or malformed values.
    pub fn get_u64(&self, key: &str, fallback: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(fallback)
    }

    pub fn set(&mut self, key: &str, value: &str) -> io::Result<()> {
        self.map.insert(key.to_string(), value.to_string());
        self.save()
    }

    /// Restore every key to its default.
    pub fn reset(&mut self) -> io::Result<()> {
        self.map = DEFAULTS
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.save()
    }

    pub fn to_display(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.map {
            out.push_str(&format!("{}={}\n", key, value));
        }
        out
    }
}
