//! Transcript Parser - Split a sanitized dialogue into ordered turns
//!
//! Input looks like:
//! ```text
//! <Person1>Welcome to the show.</Person1>
//! <Person2>Thanks for having me.</Person2>
//! ```
//! Each `(Person1, Person2)` pair becomes one [`Turn`]; a closing line from
//! Person2 is appended to the end of the conversation.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// DATA MODELS
// ============================================================================

/// One of the two fixed speaker identities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    /// Opens every turn (the "question" voice)
    Person1,
    /// Answers every turn (the "answer" voice)
    Person2,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Person1, Role::Person2];

    /// Transcript tag name
    pub fn tag(&self) -> &'static str {
        match self {
            Role::Person1 => "Person1",
            Role::Person2 => "Person2",
        }
    }

    /// Suffix used for per-role files
    pub fn file_suffix(&self) -> &'static str {
        match self {
            Role::Person1 => "person1",
            Role::Person2 => "person2",
        }
    }

    pub fn other(&self) -> Role {
        match self {
            Role::Person1 => Role::Person2,
            Role::Person2 => Role::Person1,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One alternating exchange of the dialogue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// 1-based position in the transcript
    pub index: usize,
    pub person1: String,
    pub person2: String,
}

impl Turn {
    pub fn text(&self, role: Role) -> &str {
        match role {
            Role::Person1 => &self.person1,
            Role::Person2 => &self.person2,
        }
    }

    /// Lines to synthesize, in playback order. Empty texts are skipped.
    pub fn lines(&self) -> impl Iterator<Item = DialogueLine> + '_ {
        Role::ALL.into_iter().filter_map(move |role| {
            let text = self.text(role);
            (!text.is_empty()).then(|| DialogueLine {
                turn: self.index,
                role,
                text: text.to_string(),
            })
        })
    }
}

/// A single line of one turn, the unit of synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueLine {
    pub turn: usize,
    pub role: Role,
    pub text: String,
}

/// All lines of a turn sequence in playback order
pub fn dialogue_lines(turns: &[Turn]) -> Vec<DialogueLine> {
    turns.iter().flat_map(|turn| turn.lines()).collect()
}

// ============================================================================
// TURN SEGMENTER
// ============================================================================

/// Splits sanitized text into `(Person1, Person2)` turns
pub struct TurnSegmenter {
    pair_regex: Regex,
    whitespace: Regex,
}

impl TurnSegmenter {
    pub fn new() -> Self {
        // Non-greedy, dot matches newline: a segment ends at its own closer
        let pair_regex = Regex::new(
            r"(?s)<Person1>(.*?)</Person1>\s*<Person2>(.*?)</Person2>",
        )
        .expect("static pattern");
        let whitespace = Regex::new(r"\s+").expect("static pattern");

        Self {
            pair_regex,
            whitespace,
        }
    }

    /// Segment `text` into turns, closing the conversation with `ending_message`
    ///
    /// Anything that does not parse as a well-formed pair is dropped silently.
    /// Returns an empty sequence when no pair matches at all.
    pub fn segment(&self, text: &str, ending_message: &str) -> Vec<Turn> {
        let ending = format!("<Person2>{}</Person2>", ending_message);
        let input = format!("{}{}", text, ending);
        let ending_message = self.normalize(ending_message);

        let mut turns = Vec::new();
        let mut ending_consumed = false;

        for caps in self.pair_regex.captures_iter(&input) {
            let (Some(whole), Some(p1), Some(p2)) = (caps.get(0), caps.get(1), caps.get(2)) else {
                continue;
            };

            let person1 = self.normalize(p1.as_str());
            let person2 = self.normalize(p2.as_str());

            if person1.is_empty() || person2.is_empty() {
                log::debug!("Dropping turn with empty line at byte {}", whole.start());
                continue;
            }

            ending_consumed = whole.end() == input.len();

            turns.push(Turn {
                index: turns.len() + 1,
                person1,
                person2,
            });
        }

        if turns.is_empty() {
            return turns;
        }

        if !ending_consumed && !ending_message.is_empty() {
            turns.push(Turn {
                index: turns.len() + 1,
                person1: String::new(),
                person2: ending_message,
            });
        }

        turns
    }

    fn normalize(&self, text: &str) -> String {
        self.whitespace.replace_all(text, " ").trim().to_string()
    }
}

impl Default for TurnSegmenter {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience wrapper around [`TurnSegmenter::segment`]
pub fn segment(text: &str, ending_message: &str) -> Vec<Turn> {
    TurnSegmenter::new().segment(text, ending_message)
}

// ============================================================================
// TESTS
// ============================================================================
