use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::tenant;

/// Single shared password for every user. The database name picks the tenant,
/// so a name that can't become one is refused here, before any query runs.
/// Which subject may act on which reservation is decided by the caller.
#[derive(Debug)]
pub struct SeatlineAuthSource {
    password: String,
}

impl SeatlineAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SeatlineAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let database = login.database().unwrap_or("default");
        if let Err(e) = tenant::wal_stem(database) {
            tracing::debug!(user = ?login.user(), database, "login refused: {e}");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "3D000".into(),
                format!("database \"{database}\" is not a valid tenant: {e}"),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
