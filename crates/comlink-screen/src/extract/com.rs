//! SDF COM chat screens.
//!
//! Room lines look like `[user] text`, private messages like
//! `*user* text`, either optionally preceded by a `HH:MM[:SS]` stamp. The
//! client announces the current room as `[you are in 'room' among N]`.

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use regex::Regex;
use serde_json::{json, Value};
use std::sync::LazyLock;

use super::Extraction;
use crate::element::{ElementType, ParsedScreen, ScreenEvent};

static ROOM_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:(\d{1,2}:\d{2}(?::\d{2})?)\s+)?\[([^\]\s]+)\]\s+(.+?)\s*$")
        .expect("Invalid room line regex")
});
static PRIVATE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:(\d{1,2}:\d{2}(?::\d{2})?)\s+)?\*([^*\s]+)\*\s+(.+?)\s*$")
        .expect("Invalid private line regex")
});
static ROOM_INDICATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)you are in '([^']+)'").expect("Invalid room indicator regex")
});

pub(crate) fn extract(lines: &[String]) -> Extraction {
    let mut extraction = Extraction::default();
    let mut room: Option<String> = None;
    let mut chat = Vec::new();
    let mut private = Vec::new();

    for (row, line) in lines.iter().enumerate() {
        if let Some(c) = ROOM_INDICATOR.captures(line) {
            let name = c[1].to_string();
            if room.as_deref() != Some(name.as_str()) {
                extraction.events.push(ScreenEvent::RoomChanged { room: name.clone() });
            }
            room = Some(name);
            extraction.retype.push((row, ElementType::Status));
        } else if let Some(c) = PRIVATE_LINE.captures(line) {
            let from = c[2].to_string();
            let text = c[3].to_string();
            private.push(json!({ "from": from, "text": text }));
            extraction
                .events
                .push(ScreenEvent::PrivateMessage { from, text });
        } else if let Some(c) = ROOM_LINE.captures(line) {
            let time = c.get(1).map(|m| m.as_str().to_string());
            let user = c[2].to_string();
            let text = c[3].to_string();
            chat.push(json!({ "user": user, "text": text, "time": time, "room": room }));
            extraction.events.push(ScreenEvent::ChatMessage {
                room: room.clone(),
                user,
                text,
                time,
            });
            extraction.retype.push((row, ElementType::Text));
        }
    }

    extraction
        .metadata
        .insert("room".into(), room.map(Value::String).unwrap_or(Value::Null));
    extraction.metadata.insert("chat_lines".into(), Value::Array(chat));
    extraction
        .metadata
        .insert("private_messages".into(), Value::Array(private));
    extraction
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

/// Remote and local clocks may disagree by this much.
const CLOCK_SKEW_SECS: i64 = 5;

/// Our own line coming back from the room after a send.
#[derive(Debug, Clone)]
pub struct Echo<'a> {
    pub text: &'a str,
    /// Only lines said by this user count. `None` accepts any speaker.
    pub user: Option<&'a str>,
    /// Lines stamped before this instant predate the send.
    pub sent_at: DateTime<Utc>,
    /// Matching lines already on screen before the send. Snapshot channels
    /// repaint the backlog, so only lines beyond these are new.
    pub baseline: usize,
}

impl<'a> Echo<'a> {
    pub fn new(text: &'a str, sent_at: DateTime<Utc>) -> Self {
        Self {
            text,
            user: None,
            sent_at,
            baseline: 0,
        }
    }

    pub fn from_user(mut self, user: Option<&'a str>) -> Self {
        self.user = user;
        self
    }

    pub fn after(mut self, baseline: usize) -> Self {
        self.baseline = baseline;
        self
    }

    fn matches(&self, user: &str, text: &str) -> bool {
        text.trim() == self.text.trim() && self.user.map_or(true, |u| u == user)
    }

    /// Earliest printed stamp a new line may carry, at the stamp's precision.
    fn floor(&self, with_seconds: bool) -> DateTime<Utc> {
        let exact = self.sent_at.with_nanosecond(0);
        let floor = if with_seconds {
            exact
        } else {
            exact.and_then(|t| t.with_second(0))
        };
        floor.unwrap_or(self.sent_at) - Duration::seconds(CLOCK_SKEW_SECS)
    }
}

/// Room lines on `screen` that `echo` would accept, ignoring their stamps.
pub fn count_echoes(screen: &ParsedScreen, echo: &Echo<'_>) -> usize {
    screen
        .events
        .iter()
        .filter(|event| {
            matches!(event, ScreenEvent::ChatMessage { user, text, .. } if echo.matches(user, text))
        })
        .count()
}

/// When the remote side echoed our line back, according to `screen`.
///
/// Only the most recent matching room line is considered, and only when
/// there are more matches than `echo.baseline`. A printed stamp is taken on
/// the capture date (the previous day if that would put it in the future)
/// and must not predate the send; an unstamped line gets the capture time
/// of the frame. `None` means the echo is not on this screen.
pub fn find_echo(screen: &ParsedScreen, echo: &Echo<'_>) -> Option<DateTime<Utc>> {
    let matches: Vec<&Option<String>> = screen
        .events
        .iter()
        .filter_map(|event| match event {
            ScreenEvent::ChatMessage {
                user, text, time, ..
            } if echo.matches(user, text) => Some(time),
            _ => None,
        })
        .collect();
    if matches.len() <= echo.baseline {
        return None;
    }
    let time = matches.last()?.as_deref();

    let Some(raw) = time else {
        return Some(screen.captured_at);
    };
    let stamp = parse_time(raw)?;
    let mut at = screen.captured_at.date_naive().and_time(stamp).and_utc();
    if at > screen.captured_at + Duration::minutes(1) {
        at = at - Duration::days(1);
    }
    let with_seconds = raw.matches(':').count() == 2;
    (at >= echo.floor(with_seconds)).then_some(at)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<String> {
        text.lines().map(str::to_string).collect()
    }

    #[test]
    fn test_room_and_chat_lines() {
        let l = lines(
            "[you are in 'lounge' among 4]\n\
             [alice] hi all\n\
             12:01 [bob] hey alice\n\
             *carol* psst",
        );
        let e = extract(&l);

        assert_eq!(e.metadata["room"], "lounge");
        assert_eq!(
            e.events,
            vec![
                ScreenEvent::RoomChanged {
                    room: "lounge".into()
                },
                ScreenEvent::ChatMessage {
                    room: Some("lounge".into()),
                    user: "alice".into(),
                    text: "hi all".into(),
                    time: None,
                },
                ScreenEvent::ChatMessage {
                    room: Some("lounge".into()),
                    user: "bob".into(),
                    text: "hey alice".into(),
                    time: Some("12:01".into()),
                },
                ScreenEvent::PrivateMessage {
                    from: "carol".into(),
                    text: "psst".into(),
                },
            ]
        );
    }

    #[test]
    fn test_room_switch_emits_event() {
        let l = lines("[you are in 'lounge' among 4]\n[you are in 'hackers' among 2]");
        let e = extract(&l);
        assert_eq!(e.events.len(), 2);
        assert_eq!(e.metadata["room"], "hackers");
    }

    #[test]
    fn test_parse_time_formats() {
        assert!(parse_time("12:01").is_some());
        assert!(parse_time("12:01:59").is_some());
        assert!(parse_time("noon").is_none());
    }

    fn screen(text: &str, captured: DateTime<Utc>) -> ParsedScreen {
        crate::ScreenParser::new().parse_at(text.as_bytes(), crate::Application::ComChat, captured)
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        use chrono::TimeZone;
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_echo_ignores_other_speakers() {
        let s = screen("09:30:01 [alice] hi", at(9, 30, 5));
        let sent = at(9, 30, 0);
        assert!(find_echo(&s, &Echo::new("hi", sent).from_user(Some("bot"))).is_none());
        assert_eq!(find_echo(&s, &Echo::new("hi", sent)), Some(at(9, 30, 1)));
    }

    #[test]
    fn test_echo_stamped_before_send_is_old() {
        let s = screen("08:00:00 [bot] hi", at(9, 30, 0));
        let echo = Echo::new("hi", at(9, 29, 59)).from_user(Some("bot"));
        assert!(find_echo(&s, &echo).is_none());

        // Minute stamps are compared at minute precision
        let s = screen("09:29 [bot] hi", at(9, 29, 50));
        let echo = Echo::new("hi", at(9, 29, 40)).from_user(Some("bot"));
        assert_eq!(find_echo(&s, &echo), Some(at(9, 29, 0)));
    }

    #[test]
    fn test_echo_needs_a_line_beyond_the_backlog() {
        let before = screen("[bot] hi\n[alice] hey", at(9, 0, 0));
        let echo = Echo::new("hi", at(9, 0, 1)).from_user(Some("bot"));
        let baseline = count_echoes(&before, &echo);
        assert_eq!(baseline, 1);
        let echo = echo.after(baseline);

        let repaint = screen("[bot] hi\n[alice] hey", at(9, 0, 2));
        assert!(find_echo(&repaint, &echo).is_none());

        let fresh = screen("[bot] hi\n[alice] hey\n[bot] hi", at(9, 0, 3));
        assert_eq!(find_echo(&fresh, &echo), Some(at(9, 0, 3)));
    }
}
