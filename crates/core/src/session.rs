use std::fmt;

use chrono::Utc;
use uuid::Uuid;

/// Accounting identity of a kiosk caller.
///
/// The IP is best-effort (forwarding headers first, socket peer as a
/// fallback); the device id is an opaque token supplied by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientId {
    /// Client IP address, or a synthesized token when none could be derived.
    pub ip: String,
    /// Opaque device identifier supplied by the client.
    pub device_id: String,
}

impl ClientId {
    /// Build a client identity, substituting `"unknown"` for empty fields.
    pub fn new(ip: impl Into<String>, device_id: impl Into<String>) -> Self {
        let ip = non_empty_or_unknown(ip.into());
        let device_id = non_empty_or_unknown(device_id.into());
        Self { ip, device_id }
    }
}

fn non_empty_or_unknown(value: String) -> String {
    if value.trim().is_empty() {
        "unknown".to_string()
    } else {
        value.trim().to_string()
    }
}

/// A monotonically numbered quota scope for one client IP.
///
/// Rendered as `<ip>_override<N>` with `N >= 1`; the rendered form is
/// embedded in every artifact name for the session, which makes the artifact
/// store itself the ledger of consumption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId {
    ip: String,
    number: u32,
}

/// Error from parsing a rendered session identifier.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid session identifier: {0:?}")]
pub struct SessionParseError(pub String);

impl SessionId {
    /// Build a session identifier. Numbers below 1 are clamped to 1.
    pub fn new(ip: impl Into<String>, number: u32) -> Self {
        Self {
            ip: ip.into(),
            number: number.max(1),
        }
    }

    /// The client IP this session belongs to.
    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// The override number (`>= 1`).
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Parse a rendered `<ip>_override<N>` identifier.
    pub fn parse(raw: &str) -> Result<Self, SessionParseError> {
        let (ip, rest) = raw
            .rsplit_once("_override")
            .ok_or_else(|| SessionParseError(raw.to_string()))?;
        if ip.is_empty() {
            return Err(SessionParseError(raw.to_string()));
        }
        let number: u32 = rest
            .parse()
            .map_err(|_| SessionParseError(raw.to_string()))?;
        if number == 0 {
            return Err(SessionParseError(raw.to_string()));
        }
        Ok(Self {
            ip: ip.to_string(),
            number,
        })
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_override{}", self.ip, self.number)
    }
}

/// The three kinds of stored artifacts, each with its own bucket prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Generated still image (`cards/`).
    Card,
    /// Generated animation (`videos/`).
    Video,
    /// Card queued for physical printing (`print-queue/`).
    Print,
}

impl ArtifactKind {
    /// Top-level store prefix for this kind.
    pub fn folder(self) -> &'static str {
        match self {
            ArtifactKind::Card => "cards",
            ArtifactKind::Video => "videos",
            ArtifactKind::Print => "print-queue",
        }
    }
}

/// UTC timestamp component used in artifact names (`YYYYMMDD_HHMMSS`).
pub fn artifact_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

// Second-resolution timestamps collide under concurrent writers; a short
// random suffix keeps names unique without affecting prefix counting.
fn entropy_suffix() -> String {
    Uuid::new_v4().simple().to_string().chars().take(6).collect()
}

/// Object key for the next card artifact in a session.
pub fn card_key(session: &SessionId, card_number: u32) -> String {
    format!(
        "cards/{session}_card_{card_number}_{}_{}.png",
        artifact_timestamp(),
        entropy_suffix()
    )
}

/// Object key for the next video artifact in a session.
pub fn video_key(session: &SessionId, video_number: u32) -> String {
    format!(
        "videos/{session}_video_{video_number}_{}_{}.mp4",
        artifact_timestamp(),
        entropy_suffix()
    )
}

/// Object key for a print artifact.
///
/// Carries two sequence numbers: the card being printed and the per-session
/// print-queue position.
pub fn print_key(session: &SessionId, card_number: u32, print_number: u32) -> String {
    format!(
        "print-queue/{session}_card_{card_number}_print_{print_number}_{}_{}.png",
        artifact_timestamp(),
        entropy_suffix()
    )
}

/// Well-known key of the pending-override marker for a client IP.
pub fn pending_marker_key(ip: &str) -> String {
    format!("pending-overrides/{ip}_pending")
}

/// Extract the override number embedded in an artifact key, if any.
pub fn override_number_in_key(key: &str) -> Option<u32> {
    let (_, rest) = key.split_once("_override")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_renders_and_parses() {
        let session = SessionId::new("1.2.3.4", 3);
        assert_eq!(session.to_string(), "1.2.3.4_override3");
        assert_eq!(SessionId::parse("1.2.3.4_override3"), Ok(session));
    }

    #[test]
    fn session_id_rejects_malformed_input() {
        assert!(SessionId::parse("1.2.3.4").is_err());
        assert!(SessionId::parse("_override2").is_err());
        assert!(SessionId::parse("1.2.3.4_override0").is_err());
        assert!(SessionId::parse("1.2.3.4_overrideX").is_err());
    }

    #[test]
    fn session_number_is_clamped_to_one() {
        assert_eq!(SessionId::new("1.2.3.4", 0).number(), 1);
    }

    #[test]
    fn artifact_keys_carry_the_session_and_sequence() {
        let session = SessionId::new("1.2.3.4", 1);

        let card = card_key(&session, 1);
        assert!(card.starts_with("cards/1.2.3.4_override1_card_1_"));
        assert!(card.ends_with(".png"));

        let video = video_key(&session, 2);
        assert!(video.starts_with("videos/1.2.3.4_override1_video_2_"));
        assert!(video.ends_with(".mp4"));

        let print = print_key(&session, 2, 1);
        assert!(print.starts_with("print-queue/1.2.3.4_override1_card_2_print_1_"));
        assert!(print.ends_with(".png"));
    }

    #[test]
    fn override_number_is_recovered_from_keys() {
        let session = SessionId::new("10.0.0.9", 4);
        assert_eq!(override_number_in_key(&card_key(&session, 1)), Some(4));
        assert_eq!(override_number_in_key(&print_key(&session, 1, 1)), Some(4));
        assert_eq!(override_number_in_key("cards/plain.png"), None);
    }

    #[test]
    fn client_id_normalizes_empty_fields() {
        let id = ClientId::new("  ", "d1");
        assert_eq!(id.ip, "unknown");
        assert_eq!(id.device_id, "d1");
    }
}
