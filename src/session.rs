//! Admin "new shop" wizard state.
//!
//! An admin adds a shop one answer at a time:
//!
//! ```text
//! Name -> Type -> District -> Address -> Url -> Location -> Tags -> Confirm
//! ```
//!
//! The location step is skipped when the district is [`ONLINE_DISTRICT`];
//! such shops are stored as online-only. Blank answers to the address and
//! URL steps leave the field empty, and `-` does the same for tags.
//!
//! Sessions live in a [`TtlCache`] under the `<U>` namespace, so an
//! abandoned wizard disappears after the session TTL.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use shopfinder_core::models::{Coord, Location, Shop};
use shopfinder_core::store::ShopStore;

use crate::cache::{TtlCache, SESSION_PREFIX};
use crate::config::CacheConfig;

/// District name that marks a shop without premises.
pub const ONLINE_DISTRICT: &str = "網店";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Name,
    Type,
    District,
    Address,
    Url,
    Location,
    Tags,
    Confirm,
}

impl Step {
    pub fn prompt(&self) -> &'static str {
        match self {
            Step::Name => "Shop name?",
            Step::Type => "Shop type?",
            Step::District => "District? (網店 for online-only)",
            Step::Address => "Address? (blank for none)",
            Step::Url => "Website? (blank for none)",
            Step::Location => "Location? (lat,lon)",
            Step::Tags => "Keywords, space separated? (- for none)",
            Step::Confirm => "Save this shop? (yes/no)",
        }
    }
}

/// One answer from the admin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Input {
    Location { lat: f64, lon: f64 },
    Text { text: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("a location is required at this step")]
    ExpectedLocation,

    #[error("a text answer is required at this step")]
    ExpectedText,

    #[error("{0} cannot be empty")]
    Empty(&'static str),

    #[error("invalid location ({lat}, {lon})")]
    InvalidLocation { lat: f64, lon: f64 },

    #[error("no admin session for chat {0}")]
    NoSession(i64),
}

/// What happened after an answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Ask the next question.
    Next(Step),
    /// The admin confirmed; the draft is ready to insert.
    Ready(Shop),
    Cancelled,
}

/// A wizard in progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdminSession {
    pub step: Step,
    pub draft: Shop,
}

impl Default for AdminSession {
    fn default() -> Self {
        Self {
            step: Step::Name,
            draft: Shop::new("", "", ""),
        }
    }
}

impl AdminSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one answer and move to the next step.
    ///
    /// On error the session is unchanged and the same step is asked again.
    pub fn advance(&mut self, input: Input) -> Result<Outcome, SessionError> {
        if self.step == Step::Location {
            let Input::Location { lat, lon } = input else {
                return Err(SessionError::ExpectedLocation);
            };
            let coord = Coord::new(lat, lon);
            if !coord.is_valid() {
                return Err(SessionError::InvalidLocation { lat, lon });
            }
            self.draft.location = Location::Coord(coord);
            self.step = Step::Tags;
            return Ok(Outcome::Next(self.step));
        }

        let Input::Text { text } = input else {
            return Err(SessionError::ExpectedText);
        };
        let text = text.trim();

        self.step = match self.step {
            Step::Name => {
                self.draft.name = required(text, "name")?;
                Step::Type
            }
            Step::Type => {
                self.draft.kind = required(text, "type")?;
                Step::District
            }
            Step::District => {
                self.draft.district = required(text, "district")?;
                Step::Address
            }
            Step::Address => {
                self.draft.address = optional(text);
                Step::Url
            }
            Step::Url => {
                self.draft.url = optional(text);
                if self.draft.district == ONLINE_DISTRICT {
                    self.draft.location = Location::Online;
                    Step::Tags
                } else {
                    Step::Location
                }
            }
            Step::Tags => {
                self.draft.tags = if text == "-" {
                    Vec::new()
                } else {
                    text.split_whitespace().map(str::to_string).collect()
                };
                Step::Confirm
            }
            Step::Confirm => {
                return match text.to_lowercase().as_str() {
                    "y" | "yes" => Ok(Outcome::Ready(self.draft.clone())),
                    _ => Ok(Outcome::Cancelled),
                };
            }
            Step::Location => return Err(SessionError::ExpectedLocation),
        };
        Ok(Outcome::Next(self.step))
    }
}

fn required(text: &str, what: &'static str) -> Result<String, SessionError> {
    if text.is_empty() {
        return Err(SessionError::Empty(what));
    }
    Ok(text.to_string())
}

fn optional(text: &str) -> Option<String> {
    (!text.is_empty()).then(|| text.to_string())
}

/// Reply to an answer: the updated session, or the id of the saved shop.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ask(AdminSession),
    Saved(i64),
    Cancelled,
}

/// Per-chat wizard state with a short TTL.
pub struct SessionStore {
    sessions: TtlCache<AdminSession>,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: TtlCache::new(ttl),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            sessions: TtlCache::with_sweeper(config.session_ttl(), config.sweep_interval()),
        }
    }

    fn key(chat_id: i64) -> String {
        format!("{SESSION_PREFIX}{chat_id}")
    }

    /// Start (or restart) a wizard for `chat_id`.
    pub fn start(&self, chat_id: i64) -> AdminSession {
        let session = AdminSession::new();
        self.sessions.insert(Self::key(chat_id), session.clone());
        session
    }

    pub fn get(&self, chat_id: i64) -> Option<AdminSession> {
        self.sessions.get(&Self::key(chat_id))
    }

    pub fn end(&self, chat_id: i64) {
        self.sessions.remove(&Self::key(chat_id));
    }

    /// Feed one answer. A confirmed draft is inserted through `store`.
    ///
    /// Every accepted answer refreshes the session TTL.
    pub async fn answer(
        &self,
        chat_id: i64,
        input: Input,
        store: &dyn ShopStore,
    ) -> anyhow::Result<Reply> {
        let mut session = self.get(chat_id).ok_or(SessionError::NoSession(chat_id))?;
        match session.advance(input)? {
            Outcome::Next(_) => {
                self.sessions.insert(Self::key(chat_id), session.clone());
                Ok(Reply::Ask(session))
            }
            Outcome::Ready(shop) => {
                let id = store.insert_shop(&shop).await?;
                self.end(chat_id);
                tracing::info!(shop_id = id, name = %shop.name, "shop added by admin");
                Ok(Reply::Saved(id))
            }
            Outcome::Cancelled => {
                self.end(chat_id);
                Ok(Reply::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopfinder_core::store::memory::InMemoryStore;

    fn text(s: &str) -> Input {
        Input::Text { text: s.into() }
    }

    #[test]
    fn physical_shop_walks_every_step() {
        let mut s = AdminSession::new();
        assert_eq!(s.advance(text("Kiss Cafe")), Ok(Outcome::Next(Step::Type)));
        assert_eq!(s.advance(text("咖啡")), Ok(Outcome::Next(Step::District)));
        assert_eq!(s.advance(text("中環")), Ok(Outcome::Next(Step::Address)));
        assert_eq!(s.advance(text("1 Queen's Road")), Ok(Outcome::Next(Step::Url)));
        assert_eq!(s.advance(text("")), Ok(Outcome::Next(Step::Location)));
        assert_eq!(s.advance(text("22.28,114.15")), Err(SessionError::ExpectedLocation));
        assert_eq!(
            s.advance(Input::Location { lat: 22.28, lon: 114.15 }),
            Ok(Outcome::Next(Step::Tags))
        );
        assert_eq!(s.advance(text("咖啡 甜品")), Ok(Outcome::Next(Step::Confirm)));

        let Ok(Outcome::Ready(shop)) = s.advance(text("yes")) else {
            panic!("expected a ready draft");
        };
        assert_eq!(shop.url, None);
        assert_eq!(shop.tags, vec!["咖啡", "甜品"]);
        assert_eq!(shop.location, Location::Coord(Coord::new(22.28, 114.15)));
    }

    #[test]
    fn online_district_skips_location() {
        let mut s = AdminSession::new();
        for answer in ["Zine Shop", "書店", ONLINE_DISTRICT, ""] {
            s.advance(text(answer)).unwrap();
        }
        assert_eq!(
            s.advance(text("https://zine.example")),
            Ok(Outcome::Next(Step::Tags))
        );
        assert_eq!(s.draft.location, Location::Online);
    }

    #[test]
    fn empty_name_is_asked_again() {
        let mut s = AdminSession::new();
        assert_eq!(s.advance(text("  ")), Err(SessionError::Empty("name")));
        assert_eq!(s.step, Step::Name);
    }

    #[tokio::test]
    async fn confirmed_wizard_inserts_and_ends_session() {
        let sessions = SessionStore::new(Duration::from_secs(120));
        let store = InMemoryStore::new();
        sessions.start(7);
        for answer in ["Zine Shop", "書店", ONLINE_DISTRICT, "", "https://zine.example", "-"] {
            sessions.answer(7, text(answer), &store).await.unwrap();
        }
        let reply = sessions.answer(7, text("y"), &store).await.unwrap();
        assert_eq!(reply, Reply::Saved(1));
        assert!(sessions.get(7).is_none());
        assert_eq!(store.shop_by_id(1).await.unwrap().location, Location::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_expires() {
        let sessions = SessionStore::new(Duration::from_secs(120));
        let store = InMemoryStore::new();
        sessions.start(1);
        tokio::time::advance(Duration::from_secs(121)).await;
        let err = sessions.answer(1, text("late"), &store).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<SessionError>(),
            Some(&SessionError::NoSession(1))
        );
    }
}
