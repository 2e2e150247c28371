//! Secret redaction for anything that leaves the process: job arguments,
//! job results, error text, log excerpts and event payloads.
//!
//! Redaction works at two levels. Fields known to carry secrets are
//! replaced by [`REDACTED`] wherever they appear in a JSON document, and the
//! values seen in those fields are remembered so free text (error messages,
//! tracebacks, log lines) can be scrubbed of them afterwards.

use hastor_sys::secret::REDACTED;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Secrets shorter than this are not scrubbed from free text; replacing
/// one- or two-character substrings would destroy the message.
pub const MIN_SCRUB_LEN: usize = 3;

const DEFAULT_SECRET_FIELDS: &[&str] = &[
    "password",
    "bindpw",
    "secret",
    "api_key",
    "passphrase",
    "private_key",
    "token",
];

/// Per-method secret field table plus the set of secret values seen so far.
#[derive(Debug)]
pub struct RedactionTable {
    defaults: HashSet<String>,
    methods: RwLock<HashMap<String, HashSet<String>>>,
    known: RwLock<BTreeSet<String>>,
}

impl Default for RedactionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RedactionTable {
    /// Table with the default secret field names.
    pub fn new() -> Self {
        Self {
            defaults: DEFAULT_SECRET_FIELDS.iter().map(|s| s.to_string()).collect(),
            methods: RwLock::new(HashMap::new()),
            known: RwLock::new(BTreeSet::new()),
        }
    }

    /// Declare extra secret fields for `method`.
    pub fn register(&self, method: &str, fields: &[&str]) {
        self.methods
            .write()
            .entry(method.to_string())
            .or_default()
            .extend(fields.iter().map(|f| f.to_ascii_lowercase()));
    }

    /// True if `field` holds a secret for `method`.
    pub fn is_secret_field(&self, method: &str, field: &str) -> bool {
        let field = field.to_ascii_lowercase();
        if self.defaults.contains(&field) {
            return true;
        }
        self.methods
            .read()
            .get(method)
            .is_some_and(|fields| fields.contains(&field))
    }

    /// Remember a secret value so it is scrubbed from free text.
    pub fn remember(&self, secret: &str) {
        if secret.len() >= MIN_SCRUB_LEN {
            self.known.write().insert(secret.to_string());
        }
    }

    /// Copy of `value` with every secret field replaced by [`REDACTED`].
    /// The secret values are remembered, and remaining strings are scrubbed.
    pub fn redact(&self, method: &str, value: &Value) -> Value {
        self.collect(method, value);
        self.scrub_value(&self.mask(method, value))
    }

    fn collect(&self, method: &str, value: &Value) {
        match value {
            Value::Object(map) => {
                for (k, v) in map {
                    if self.is_secret_field(method, k) {
                        self.remember_value(v);
                    } else {
                        self.collect(method, v);
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|v| self.collect(method, v)),
            _ => {}
        }
    }

    fn remember_value(&self, value: &Value) {
        match value {
            Value::String(s) => self.remember(s),
            Value::Array(items) => items.iter().for_each(|v| self.remember_value(v)),
            Value::Object(map) => map.values().for_each(|v| self.remember_value(v)),
            _ => {}
        }
    }

    fn mask(&self, method: &str, value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let masked: Map<String, Value> = map
                    .iter()
                    .map(|(k, v)| {
                        let v = if self.is_secret_field(method, k) && !v.is_null() {
                            Value::String(REDACTED.to_string())
                        } else {
                            self.mask(method, v)
                        };
                        (k.clone(), v)
                    })
                    .collect();
                Value::Object(masked)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.mask(method, v)).collect()),
            other => other.clone(),
        }
    }

    /// Replace every known secret occurring in `text`.
    pub fn scrub(&self, text: &str) -> String {
        let known = self.known.read();
        // Longest first so a secret containing another is replaced whole.
        let mut secrets: Vec<&String> = known.iter().filter(|s| text.contains(s.as_str())).collect();
        if secrets.is_empty() {
            return text.to_string();
        }
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
        let mut out = text.to_string();
        for secret in secrets {
            out = out.replace(secret.as_str(), REDACTED);
        }
        out
    }

    /// Scrub every string inside `value`.
    pub fn scrub_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.scrub(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.scrub_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.scrub_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_default_fields_masked() {
        let table = RedactionTable::new();
        let args = json!({"domainname": "AD.EXAMPLE.COM", "bindpw": "hunter22", "nested": {"password": "s3cret!"}});
        let out = table.redact("directoryservices.update", &args);
        assert_eq!(out["bindpw"], REDACTED);
        assert_eq!(out["nested"]["password"], REDACTED);
        assert_eq!(out["domainname"], "AD.EXAMPLE.COM");
    }

    #[test]
    fn test_registered_fields_masked() {
        let table = RedactionTable::new();
        table.register("kerberos.keytab.create", &["File"]);
        let out = table.redact("kerberos.keytab.create", &json!({"file": "BQIAAA==", "name": "x"}));
        assert_eq!(out["file"], REDACTED);
        let other = table.redact("other.method", &json!({"file": "plain"}));
        assert_eq!(other["file"], "plain");
    }

    #[test]
    fn test_null_secret_left_null() {
        let table = RedactionTable::new();
        let out = table.redact("m", &json!({"password": null}));
        assert!(out["password"].is_null());
    }

    #[test]
    fn test_scrub_free_text() {
        let table = RedactionTable::new();
        table.redact("m", &json!({"password": "Passw0rd"}));
        let msg = table.scrub("kinit failed for admin with Passw0rd: preauth failed");
        assert!(!msg.contains("Passw0rd"));
        assert!(msg.contains(REDACTED));
    }

    #[test]
    fn test_short_secret_not_scrubbed() {
        let table = RedactionTable::new();
        table.remember("ab");
        assert_eq!(table.scrub("abc"), "abc");
    }

    #[test]
    fn test_overlapping_secrets() {
        let table = RedactionTable::new();
        table.remember("pass");
        table.remember("password123");
        assert_eq!(table.scrub("x password123 y"), format!("x {REDACTED} y"));
    }

    proptest! {
        #[test]
        fn prop_secret_never_survives(secret in "[A-Za-z0-9!@#%]{6,24}", prefix in "[a-z ]{0,16}") {
            let table = RedactionTable::new();
            let args = json!({"bindpw": secret.clone(), "note": format!("{prefix}{secret}")});
            let out = table.redact("m", &args);
            let rendered = out.to_string();
            prop_assert!(!rendered.contains(&secret));
            let err = table.scrub(&format!("error: bind as {secret} failed"));
            prop_assert!(!err.contains(&secret));
        }
    }
}
