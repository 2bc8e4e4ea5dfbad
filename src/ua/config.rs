use crate::message::uri::Uri;
use crate::transport::SipConnection;
use crate::{Error, Result};
use std::time::Duration;

pub const DEFAULT_REGISTER_EXPIRES: u32 = 600;
pub const DEFAULT_NO_ANSWER_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_RECOVERY_MIN: Duration = Duration::from_secs(2);
pub const DEFAULT_RECOVERY_MAX: Duration = Duration::from_secs(30);

/// User-agent configuration.
///
/// `uri` is the address of record. Construction gives workable defaults;
/// `validate` runs when the user agent is built and rejects inconsistent
/// settings synchronously.
#[derive(Clone)]
pub struct UAConfig {
    pub uri: Uri,
    pub display_name: Option<String>,
    pub authorization_user: Option<String>,
    pub password: Option<String>,
    pub ha1: Option<String>,
    pub realm: Option<String>,
    pub register: bool,
    pub register_expires: u32,
    pub registrar_server: Option<Uri>,
    pub contact_uri: Option<Uri>,
    pub instance_id: Option<String>,
    pub no_answer_timeout: Duration,
    pub connection_recovery_min_interval: Duration,
    pub connection_recovery_max_interval: Duration,
    pub session_timers_enabled: bool,
    pub sockets: Vec<SipConnection>,
}

impl UAConfig {
    pub fn new(aor: &str, sockets: Vec<SipConnection>) -> Result<Self> {
        let uri = Uri::parse(aor)
            .map_err(|e| Error::ConfigurationError(format!("bad uri: {}", e)))?;
        Ok(UAConfig {
            uri,
            display_name: None,
            authorization_user: None,
            password: None,
            ha1: None,
            realm: None,
            register: false,
            register_expires: DEFAULT_REGISTER_EXPIRES,
            registrar_server: None,
            contact_uri: None,
            instance_id: None,
            no_answer_timeout: DEFAULT_NO_ANSWER_TIMEOUT,
            connection_recovery_min_interval: DEFAULT_RECOVERY_MIN,
            connection_recovery_max_interval: DEFAULT_RECOVERY_MAX,
            session_timers_enabled: false,
            sockets,
        })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.uri.user.as_deref().unwrap_or("").is_empty() {
            return Err(Error::ConfigurationError(
                "uri must carry a user part".to_string(),
            ));
        }
        if self.sockets.is_empty() {
            return Err(Error::ConfigurationError(
                "at least one socket is required".to_string(),
            ));
        }
        if self.register_expires == 0 {
            return Err(Error::ConfigurationError(
                "register_expires must be positive".to_string(),
            ));
        }
        if self.connection_recovery_min_interval.is_zero()
            || self.connection_recovery_max_interval < self.connection_recovery_min_interval
        {
            return Err(Error::ConfigurationError(
                "connection recovery intervals must be positive and ordered".to_string(),
            ));
        }
        if let Some(registrar) = &self.registrar_server {
            if registrar.user.is_some() {
                return Err(Error::ConfigurationError(
                    "registrar_server must not carry a user part".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Digest username: explicit authorization user, else the AOR user.
    pub(crate) fn auth_username(&self) -> String {
        self.authorization_user
            .clone()
            .or_else(|| self.uri.user.clone())
            .unwrap_or_default()
    }
}
