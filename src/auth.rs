use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Shared-password identity: every user name authenticates against the one
/// configured secret.
#[derive(Debug)]
pub struct SlotkeeperAuthSource {
    password: String,
}

impl SlotkeeperAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SlotkeeperAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        tracing::debug!(user = ?login.user(), database = ?login.database(), "password requested");
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
