use crate::audio::AudioFormat;
use crate::error::AppError;

use std::env;
use time::UtcOffset;

pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub twilio_from_number: String,
    /// Externally reachable base URL of this service, used in Twilio callbacks.
    pub public_base_url: String,
    /// Base URL of the booking backend the tool calls are executed against.
    pub backend_base_url: String,
    pub voice_model_url: String,
    pub voice_model_api_key: String,
    pub voice_model_audio_format: AudioFormat,
    pub google_maps_api_key: Option<String>,
    pub fallback_booking_url: String,
    pub dispatch_utc_offset: UtcOffset,
}

fn required(key: &str) -> Result<String, AppError> {
    env::var(key).map_err(|_| AppError::Config(format!("{key} not set!")))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Parse `+HH:MM` / `-HH:MM`.
pub fn parse_offset(raw: &str) -> Result<UtcOffset, AppError> {
    let format = time::macros::format_description!("[offset_hour sign:mandatory]:[offset_minute]");
    UtcOffset::parse(raw.trim(), format)
        .map_err(|e| AppError::Config(format!("invalid DISPATCH_UTC_OFFSET '{raw}': {e}")))
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let voice_model_audio_format = match optional("VOICE_MODEL_AUDIO_FORMAT") {
            Some(raw) => AudioFormat::parse(&raw).ok_or_else(|| {
                AppError::Config(format!("unsupported VOICE_MODEL_AUDIO_FORMAT '{raw}'"))
            })?,
            None => AudioFormat::G711Ulaw,
        };
        let dispatch_utc_offset = match optional("DISPATCH_UTC_OFFSET") {
            Some(raw) => parse_offset(&raw)?,
            None => UtcOffset::UTC,
        };

        Ok(Self {
            bind_addr: optional("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".to_string()),
            database_url: required("DATABASE_URL")?,
            twilio_account_sid: required("TWILIO_ACCOUNT_SID")?,
            twilio_auth_token: required("TWILIO_AUTH_TOKEN")?,
            twilio_from_number: required("TWILIO_FROM_NUMBER")?,
            public_base_url: required("PUBLIC_BASE_URL")?,
            backend_base_url: required("BACKEND_BASE_URL")?,
            voice_model_url: required("VOICE_MODEL_URL")?,
            voice_model_api_key: required("VOICE_MODEL_API_KEY")?,
            voice_model_audio_format,
            google_maps_api_key: optional("GOOGLE_MAPS_API_KEY"),
            fallback_booking_url: required("FALLBACK_BOOKING_URL")?,
            dispatch_utc_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::offset;

    #[test]
    fn offsets() {
        assert_eq!(parse_offset("-05:00").unwrap(), offset!(-5));
        assert_eq!(parse_offset("+05:30").unwrap(), offset!(+5:30));
        assert!(parse_offset("EST").is_err());
    }
}
