//! Kerberos ticket acquisition and inspection through the MIT tools.

use crate::error::{CallError, CallResult, Errno};
use crate::exec::{CommandSpec, Runner};
use crate::klist::{parse_klist, KlistOutput};
use crate::secret::SecretString;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// System credential cache.
pub const SYSTEM_CCACHE: &str = "/var/run/middleware/krb5cc_0";
/// System keytab.
pub const SYSTEM_KEYTAB: &str = "/etc/krb5.keytab";
/// System kerberos configuration.
pub const SYSTEM_KRB5_CONF: &str = "/etc/krb5.conf";

/// Credential used to obtain a ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KinitCredential {
    /// Principal and password.
    Password {
        /// Client principal.
        principal: String,
        /// Password, fed through stdin.
        password: SecretString,
    },
    /// Principal with a key in a keytab.
    Keytab {
        /// Client principal.
        principal: String,
        /// Keytab holding the principal's key.
        keytab: PathBuf,
    },
}

impl KinitCredential {
    /// Client principal.
    pub fn principal(&self) -> &str {
        match self {
            KinitCredential::Password { principal, .. } => principal,
            KinitCredential::Keytab { principal, .. } => principal,
        }
    }
}

/// Options for [`Kerberos::kinit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KinitOptions {
    /// Target credential cache.
    pub ccache: PathBuf,
    /// Send requests to this KDC instead of the configured ones.
    pub kdc: Option<String>,
    /// Request a renewable ticket with this renewal lifetime.
    pub renewable: Option<Duration>,
    /// Network timeout.
    pub timeout: Duration,
}

impl Default for KinitOptions {
    fn default() -> Self {
        Self {
            ccache: PathBuf::from(SYSTEM_CCACHE),
            kdc: None,
            renewable: Some(Duration::from_secs(7 * 86400)),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Summary of the current ticket-granting ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KrbCred {
    /// Client principal.
    pub principal: String,
    /// Expiry in local time.
    pub expires: NaiveDateTime,
}

impl KrbCred {
    /// Whether the ticket has expired at `now` (local time).
    pub fn expired_at(&self, now: NaiveDateTime) -> bool {
        self.expires <= now
    }
}

/// Kerberos contract.
#[async_trait]
pub trait Kerberos: Send + Sync {
    /// Obtain a ticket.
    async fn kinit(&self, cred: &KinitCredential, opts: &KinitOptions) -> CallResult<()>;

    /// Destroy a credential cache.
    async fn kdestroy(&self, ccache: &Path) -> CallResult<()>;

    /// The TGT in `ccache`, `None` when the cache is empty or missing.
    async fn current_cred(&self, ccache: &Path) -> CallResult<Option<KrbCred>>;

    /// Renew the TGT in `ccache`.
    async fn renew(&self, ccache: &Path) -> CallResult<()>;
}

/// [`Kerberos`] backed by `kinit`, `kdestroy` and `klist`.
#[derive(Clone)]
pub struct MitKerberos {
    runner: Arc<dyn Runner>,
    scratch_dir: PathBuf,
}

impl MitKerberos {
    /// Create a wrapper. `scratch_dir` holds the temporary configuration
    /// used when a specific KDC is requested.
    pub fn new(runner: Arc<dyn Runner>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Full `klist -ef` listing of `ccache`.
    pub async fn klist(&self, ccache: &Path) -> CallResult<Option<KlistOutput>> {
        let out = self
            .runner
            .run(CommandSpec::new([
                "klist".to_string(),
                "-ef".to_string(),
                "-c".to_string(),
                ccache.display().to_string(),
            ]))
            .await?;
        if !out.success() {
            debug!(ccache = %ccache.display(), stderr = %out.stderr_str(), "no credentials");
            return Ok(None);
        }
        parse_klist(&out.stdout_str()).map(Some)
    }

    fn kdc_config(&self, principal: &str, kdc: &str) -> CallResult<PathBuf> {
        let realm = principal
            .rsplit_once('@')
            .map(|(_, r)| r)
            .ok_or_else(|| CallError::new(Errno::EINVAL, format!("{principal}: principal has no realm")))?;
        let conf = format!(
            "[libdefaults]\n\tdefault_realm = {realm}\n\tdns_lookup_kdc = false\n\n\
             [realms]\n\t{realm} = {{\n\t\tkdc = {kdc}\n\t}}\n"
        );
        let path = self.scratch_dir.join(format!("krb5.{}.conf", kdc.replace('/', "_")));
        crate::fsutil::atomic_write(&path, conf.as_bytes(), 0o644)?;
        Ok(path)
    }
}

#[async_trait]
impl Kerberos for MitKerberos {
    async fn kinit(&self, cred: &KinitCredential, opts: &KinitOptions) -> CallResult<()> {
        let mut argv = vec!["kinit".to_string(), "-c".to_string(), opts.ccache.display().to_string()];
        if let Some(renew) = opts.renewable {
            argv.push("-r".into());
            argv.push(format!("{}s", renew.as_secs()));
        }
        let mut spec = match cred {
            KinitCredential::Password { principal, password } => {
                // The prompter reads the password from a non-tty stdin.
                argv.push(principal.clone());
                CommandSpec::new(argv).with_input(format!("{}\n", password.expose()).into_bytes())
            }
            KinitCredential::Keytab { principal, keytab } => {
                argv.push("-k".into());
                argv.push("-t".into());
                argv.push(keytab.display().to_string());
                argv.push(principal.clone());
                CommandSpec::new(argv)
            }
        }
        .with_timeout(opts.timeout);
        if let Some(kdc) = &opts.kdc {
            let conf = self.kdc_config(cred.principal(), kdc)?;
            spec = spec.with_env("KRB5_CONFIG", conf.display().to_string());
        }
        let out = self.runner.run(spec).await?;
        if out.timed_out {
            return Err(CallError::new(
                Errno::ETIMEDOUT,
                format!("kinit for {} timed out", cred.principal()),
            ));
        }
        if !out.success() {
            return Err(CallError::new(
                Errno::EFAULT,
                format!("kinit for {} failed: {}", cred.principal(), out.stderr_str()),
            ));
        }
        info!(principal = cred.principal(), "obtained kerberos ticket");
        Ok(())
    }

    async fn kdestroy(&self, ccache: &Path) -> CallResult<()> {
        self.runner
            .run(CommandSpec::new([
                "kdestroy".to_string(),
                "-c".to_string(),
                ccache.display().to_string(),
            ]))
            .await?;
        Ok(())
    }

    async fn current_cred(&self, ccache: &Path) -> CallResult<Option<KrbCred>> {
        let Some(listing) = self.klist(ccache).await? else {
            return Ok(None);
        };
        let principal = listing.default_principal.clone().unwrap_or_default();
        Ok(listing.tgt().map(|t| KrbCred {
            principal,
            expires: t.expires,
        }))
    }

    async fn renew(&self, ccache: &Path) -> CallResult<()> {
        let out = self
            .runner
            .run(CommandSpec::new([
                "kinit".to_string(),
                "-R".to_string(),
                "-c".to_string(),
                ccache.display().to_string(),
            ]))
            .await?;
        if !out.success() {
            return Err(CallError::new(
                Errno::EFAULT,
                format!("ticket renewal failed: {}", out.stderr_str()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeRunner;

    #[tokio::test]
    async fn test_password_goes_through_stdin() {
        let runner = Arc::new(FakeRunner::new());
        let dir = tempfile::tempdir().unwrap();
        let krb = MitKerberos::new(runner.clone(), dir.path());
        let cred = KinitCredential::Password {
            principal: "admin@EXAMPLE.COM".into(),
            password: SecretString::new("hunter2"),
        };
        krb.kinit(&cred, &KinitOptions::default()).await.unwrap();
        let argv = &runner.calls()[0];
        assert!(!argv.iter().any(|a| a.contains("hunter2")));
        assert_eq!(runner.inputs()[0].as_deref(), Some(&b"hunter2\n"[..]));
    }

    #[tokio::test]
    async fn test_kdc_override_writes_config() {
        let runner = Arc::new(FakeRunner::new());
        let dir = tempfile::tempdir().unwrap();
        let krb = MitKerberos::new(runner.clone(), dir.path());
        let cred = KinitCredential::Keytab {
            principal: "TRUENAS$@AD.EXAMPLE.COM".into(),
            keytab: PathBuf::from(SYSTEM_KEYTAB),
        };
        let opts = KinitOptions {
            kdc: Some("dc1.ad.example.com".into()),
            ..Default::default()
        };
        krb.kinit(&cred, &opts).await.unwrap();
        let env = &runner.envs()[0];
        let (_, conf) = env.iter().find(|(k, _)| k == "KRB5_CONFIG").unwrap();
        let text = std::fs::read_to_string(conf).unwrap();
        assert!(text.contains("kdc = dc1.ad.example.com"));
        assert!(text.contains("default_realm = AD.EXAMPLE.COM"));
    }

    #[tokio::test]
    async fn test_kinit_failure() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["kinit"], 1, "", "Preauthentication failed");
        let dir = tempfile::tempdir().unwrap();
        let krb = MitKerberos::new(runner, dir.path());
        let cred = KinitCredential::Password {
            principal: "admin@EXAMPLE.COM".into(),
            password: SecretString::new("wrong"),
        };
        let err = krb.kinit(&cred, &KinitOptions::default()).await.unwrap_err();
        assert!(err.message.contains("Preauthentication failed"));
    }

    #[tokio::test]
    async fn test_current_cred_from_klist() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(
            &["klist"],
            0,
            "Ticket cache: FILE:/tmp/cc\nDefault principal: admin@EXAMPLE.COM\n\n\
             Valid starting       Expires              Service principal\n\
             01/02/24 10:00:00  01/02/24 20:00:00  krbtgt/EXAMPLE.COM@EXAMPLE.COM\n",
            "",
        );
        let dir = tempfile::tempdir().unwrap();
        let krb = MitKerberos::new(runner, dir.path());
        let cred = krb.current_cred(Path::new("/tmp/cc")).await.unwrap().unwrap();
        assert_eq!(cred.principal, "admin@EXAMPLE.COM");
        let before = chrono::NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert!(!cred.expired_at(before));
        assert!(cred.expired_at(before + chrono::Duration::hours(9)));
    }

    #[tokio::test]
    async fn test_current_cred_empty_cache() {
        let runner = Arc::new(FakeRunner::new());
        runner.respond(&["klist"], 1, "", "No credentials cache found");
        let dir = tempfile::tempdir().unwrap();
        let krb = MitKerberos::new(runner, dir.path());
        assert!(krb.current_cred(Path::new("/tmp/cc")).await.unwrap().is_none());
    }
}
