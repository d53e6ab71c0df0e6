use crate::error::NotifyError;
use crate::twilio_types::{render_twiml, DialAction, ResponseAction, TwilioResource};

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};

const GATEWAY_TIMEOUT: Duration = Duration::from_secs(15);
const TRANSFER_DIAL_TIMEOUT_SECS: u16 = 30;

/// Outbound SMS, voice calls and live-call transfer.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Returns the gateway's message id.
    async fn send_sms(&self, to: &str, body: &str) -> Result<String, NotifyError>;

    /// Returns the gateway's call id.
    async fn place_call(
        &self,
        to: &str,
        callback_url: &str,
        status_callback_url: &str,
    ) -> Result<String, NotifyError>;

    /// Redirect a live call so it dials `to`.
    async fn transfer_call(&self, call_sid: &str, to: &str) -> Result<(), NotifyError>;
}

pub struct TwilioNotifier {
    http_client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
    api_base: String,
}

impl TwilioNotifier {
    pub fn new(
        http_client: reqwest::Client,
        account_sid: String,
        auth_token: String,
        from_number: String,
    ) -> Self {
        Self::with_api_base(
            http_client,
            account_sid,
            auth_token,
            from_number,
            "https://api.twilio.com".to_string(),
        )
    }

    pub fn with_api_base(
        http_client: reqwest::Client,
        account_sid: String,
        auth_token: String,
        from_number: String,
        api_base: String,
    ) -> Self {
        Self {
            http_client,
            account_sid,
            auth_token,
            from_number,
            api_base,
        }
    }

    fn url(&self, resource: &str) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/{resource}",
            self.api_base, self.account_sid
        )
    }

    async fn post_form(
        &self,
        url: String,
        form: &HashMap<&str, &str>,
    ) -> Result<TwilioResource, NotifyError> {
        let resp = self
            .http_client
            .post(url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(form)
            .timeout(GATEWAY_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to twilio");
                NotifyError::Request(e)
            })?;
        let status = resp.status();
        if !status.is_success() {
            error!(status=%status, "twilio rejected request");
            return Err(NotifyError::Rejected(status.as_u16()));
        }
        resp.json::<TwilioResource>().await.map_err(|e| {
            error!(error=%e, "failed to deserialize twilio response");
            NotifyError::Request(e)
        })
    }
}

#[async_trait]
impl Notifier for TwilioNotifier {
    async fn send_sms(&self, to: &str, body: &str) -> Result<String, NotifyError> {
        let mut form = HashMap::new();
        form.insert("From", self.from_number.as_str());
        form.insert("To", to);
        form.insert("Body", body);
        let resource = self.post_form(self.url("Messages.json"), &form).await?;
        debug!(sid=%resource.sid, status=?resource.status, "sms queued");
        Ok(resource.sid)
    }

    async fn place_call(
        &self,
        to: &str,
        callback_url: &str,
        status_callback_url: &str,
    ) -> Result<String, NotifyError> {
        let mut form = HashMap::new();
        form.insert("From", self.from_number.as_str());
        form.insert("To", to);
        form.insert("Url", callback_url);
        form.insert("StatusCallback", status_callback_url);
        let resource = self.post_form(self.url("Calls.json"), &form).await?;
        debug!(sid=%resource.sid, status=?resource.status, "outbound call placed");
        Ok(resource.sid)
    }

    async fn transfer_call(&self, call_sid: &str, to: &str) -> Result<(), NotifyError> {
        let twiml = render_twiml(vec![ResponseAction::Dial(DialAction {
            number: to.to_string(),
            caller_id: Some(self.from_number.clone()),
            timeout: Some(TRANSFER_DIAL_TIMEOUT_SECS),
        })]);
        let mut form = HashMap::new();
        form.insert("Twiml", twiml.as_str());
        let resource = self
            .post_form(self.url(&format!("Calls/{call_sid}.json")), &form)
            .await?;
        debug!(sid=%resource.sid, "call transfer requested");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notifier(server: &MockServer) -> TwilioNotifier {
        TwilioNotifier::with_api_base(
            reqwest::Client::new(),
            "AC123".into(),
            "secret".into(),
            "+15550001111".into(),
            server.uri(),
        )
    }

    #[tokio::test]
    async fn sms_posts_form_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Messages.json"))
            .and(header_exists("authorization"))
            .and(body_string_contains("Body=Leak+at+12+Elm"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(serde_json::json!({"sid": "SM1", "status": "queued"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let sid = notifier(&server)
            .send_sms("+15552223333", "Leak at 12 Elm")
            .await
            .unwrap();
        assert_eq!(sid, "SM1");
    }

    #[tokio::test]
    async fn transfer_sends_dial_twiml() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/2010-04-01/Accounts/AC123/Calls/CA9.json"))
            .and(body_string_contains("Dial"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"sid": "CA9"})))
            .expect(1)
            .mount(&server)
            .await;

        notifier(&server)
            .transfer_call("CA9", "+15552223333")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_request_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let err = notifier(&server)
            .place_call("+1", "https://x/cb", "https://x/status")
            .await
            .unwrap_err();
        assert!(matches!(err, NotifyError::Rejected(400)));
    }
}
