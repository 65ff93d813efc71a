use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;
use tracing::debug;

/// Console credentials: every user shares the clinic password.
#[derive(Debug)]
pub struct ClinicAuthSource {
    password: String,
}

impl ClinicAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for ClinicAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        debug!(user = ?login.user(), clinic = ?login.database(), "console login");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
