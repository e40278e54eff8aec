use serde::{Deserialize, Serialize};

/// The three quota-bearing artifact categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    /// Generated card images.
    Cards,
    /// Generated animations.
    Videos,
    /// Physical print requests.
    Prints,
}

impl QuotaKind {
    /// Human-readable label used in limit-reached messages.
    pub fn label(self) -> &'static str {
        match self {
            QuotaKind::Cards => "card",
            QuotaKind::Videos => "video",
            QuotaKind::Prints => "print",
        }
    }
}

/// Per-session limits for each artifact kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    /// Cards allowed per session.
    pub cards: u32,
    /// Videos allowed per session.
    pub videos: u32,
    /// Prints allowed per session.
    pub prints: u32,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            cards: 5,
            videos: 3,
            prints: 1,
        }
    }
}

impl QuotaLimits {
    /// Limit for one kind.
    pub fn get(&self, kind: QuotaKind) -> u32 {
        match kind {
            QuotaKind::Cards => self.cards,
            QuotaKind::Videos => self.videos,
            QuotaKind::Prints => self.prints,
        }
    }

    /// Remaining quota given observed usage, floored at zero.
    pub fn remaining(&self, usage: &Usage) -> Remaining {
        Remaining {
            cards: self.cards.saturating_sub(usage.cards),
            videos: self.videos.saturating_sub(usage.videos),
            prints: self.prints.saturating_sub(usage.prints),
        }
    }
}

/// Artifact counts observed for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    /// Cards produced so far.
    pub cards: u32,
    /// Videos produced so far.
    pub videos: u32,
    /// Prints produced so far.
    pub prints: u32,
}

impl Usage {
    /// Usage count for one kind.
    pub fn get(&self, kind: QuotaKind) -> u32 {
        match kind {
            QuotaKind::Cards => self.cards,
            QuotaKind::Videos => self.videos,
            QuotaKind::Prints => self.prints,
        }
    }
}

/// Remaining quota returned to clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remaining {
    /// Cards left in the current session.
    pub cards: u32,
    /// Videos left in the current session.
    pub videos: u32,
    /// Prints left in the current session.
    pub prints: u32,
}
