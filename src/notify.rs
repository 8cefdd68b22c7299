use async_trait::async_trait;
use serde::Serialize;
use ulid::Ulid;

/// What the client is told about a booking. Rendered by the mail sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingNotice {
    pub reservation_id: Ulid,
    pub professional_name: String,
    pub professional_email: String,
    pub service_name: String,
    pub client_name: String,
    pub client_email: String,
    pub start: String,
    pub end: String,
    pub cancellation_url: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug)]
pub enum NotifyError {
    Render(String),
    Delivery(String),
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Render(e) => write!(f, "could not render notice: {e}"),
            NotifyError::Delivery(e) => write!(f, "could not deliver notice: {e}"),
        }
    }
}

impl std::error::Error for NotifyError {}

/// Transactional mail sender.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn booking_confirmed(&self, notice: &BookingNotice) -> Result<(), NotifyError>;
    async fn booking_cancelled(&self, notice: &BookingNotice) -> Result<(), NotifyError>;
}

/// Emits each notice as a structured log line with a JSON body.
pub struct LogNotifier;

impl LogNotifier {
    fn render(kind: &str, notice: &BookingNotice) -> Result<String, NotifyError> {
        serde_json::to_string(&serde_json::json!({ "kind": kind, "notice": notice }))
            .map_err(|e| NotifyError::Render(e.to_string()))
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn booking_confirmed(&self, notice: &BookingNotice) -> Result<(), NotifyError> {
        let body = Self::render("booking_confirmed", notice)?;
        tracing::info!(
            reservation_id = %notice.reservation_id,
            to = %notice.client_email,
            %body,
            "notify"
        );
        Ok(())
    }

    async fn booking_cancelled(&self, notice: &BookingNotice) -> Result<(), NotifyError> {
        let body = Self::render("booking_cancelled", notice)?;
        tracing::info!(
            reservation_id = %notice.reservation_id,
            to = %notice.client_email,
            %body,
            "notify"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice() -> BookingNotice {
        BookingNotice {
            reservation_id: Ulid::new(),
            professional_name: "Bea".into(),
            professional_email: "bea@example.com".into(),
            service_name: "Cut".into(),
            client_name: "Ana".into(),
            client_email: "ana@example.com".into(),
            start: "2025-06-03T10:00:00Z".into(),
            end: "2025-06-03T11:00:00Z".into(),
            cancellation_url: Some("http://localhost:3000/cancel/t".into()),
            reason: None,
        }
    }

    #[test]
    fn render_wraps_kind_and_notice() {
        let n = notice();
        let body = LogNotifier::render("booking_confirmed", &n).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["kind"], "booking_confirmed");
        assert_eq!(value["notice"]["client_email"], "ana@example.com");
        assert_eq!(value["notice"]["reservation_id"], n.reservation_id.to_string());
    }

    #[tokio::test]
    async fn log_notifier_never_fails() {
        let n = notice();
        assert!(LogNotifier.booking_confirmed(&n).await.is_ok());
        assert!(LogNotifier.booking_cancelled(&n).await.is_ok());
    }
}
