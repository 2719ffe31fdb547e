//! Question source.
//!
//! The room asks for its question list exactly once, when the countdown
//! starts. Selection is deterministic per game: the pool is filtered,
//! deduplicated, sorted by id, then shuffled with a ChaCha RNG seeded from
//! `sha256(game_id)`. The same RNG shuffles each question's options, so a
//! game id always yields the same questions in the same order with the
//! same option layout.

use std::{collections::HashSet, path::Path};

use quizroom_proto::{Choice, QuestionView};
use rand::{SeedableRng, seq::SliceRandom};
use rand_chacha::ChaCha8Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Options shown per question: the correct answer plus up to this many
/// wrong answers.
pub const MAX_WRONG_OPTIONS: usize = 3;

/// Errors from loading or drawing questions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuestionError {
    /// Question bank file unreadable
    #[error("failed to read question bank: {0}")]
    Io(String),

    /// Question bank file is not valid JSON records
    #[error("failed to parse question bank: {0}")]
    Parse(String),

    /// Nothing matched the selection
    #[error("no questions available for the selected themes")]
    Empty,
}

/// A question as stored in the bank.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QuestionRecord {
    /// Stable id
    pub id: u64,
    /// Owning theme
    pub theme_id: u32,
    /// Theme display name
    #[serde(default)]
    pub theme_name: Option<String>,
    /// Prompt
    pub text: String,
    /// The right answer
    pub correct_answer: String,
    /// Distractors; only the first few are used
    #[serde(default)]
    pub wrong_answers: Vec<String>,
    /// Scripture reference revealed with the result
    #[serde(default)]
    pub reference: Option<String>,
    /// Difficulty label (`easy`, `medium`, `hard`)
    #[serde(default)]
    pub difficulty: Option<String>,
}

/// A question frozen into a game, with its options laid out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Stable id
    pub id: u64,
    /// Owning theme
    pub theme_id: u32,
    /// Theme display name
    pub theme_name: Option<String>,
    /// Prompt
    pub text: String,
    /// Shuffled options
    pub options: Vec<String>,
    /// Position of the correct answer in `options`
    pub correct_index: usize,
    /// Scripture reference
    pub reference: Option<String>,
    /// Difficulty label
    pub difficulty: Option<String>,
}

impl Question {
    /// The correct option text.
    pub fn correct_answer(&self) -> &str {
        self.options.get(self.correct_index).map_or("", String::as_str)
    }

    /// Accepts an option index or the option text (trimmed, ASCII
    /// case-insensitive).
    pub fn is_correct(&self, choice: &Choice) -> bool {
        match choice {
            Choice::Index(index) => *index == self.correct_index,
            Choice::Text(text) => text.trim().eq_ignore_ascii_case(self.correct_answer().trim()),
        }
    }

    /// Client view; the reference stays hidden until the round result.
    pub fn view(&self) -> QuestionView {
        QuestionView {
            id: self.id,
            text: self.text.clone(),
            options: self.options.clone(),
            theme_name: self.theme_name.clone(),
            difficulty: self.difficulty.clone(),
        }
    }
}

/// What a room asks for.
#[derive(Debug, Clone, Copy)]
pub struct QuestionRequest<'a> {
    /// Seeds the shuffle
    pub game_id: &'a str,
    /// Theme filter; empty means all themes
    pub theme_ids: &'a [u32],
    /// Difficulty filter (lowercase)
    pub difficulty: Option<&'a str>,
    /// Upper bound on questions returned
    pub count: usize,
}

/// Supplies the frozen question list for a game.
pub trait QuestionSource: Send + Sync + 'static {
    /// Draw up to `request.count` questions.
    ///
    /// # Errors
    ///
    /// `QuestionError::Empty` if nothing matches the selection.
    fn draw(&self, request: &QuestionRequest<'_>) -> Result<Vec<Question>, QuestionError>;
}

/// In-memory question bank, usually loaded from a JSON file.
#[derive(Debug, Clone, Default)]
pub struct QuestionBank {
    records: Vec<QuestionRecord>,
}

impl QuestionBank {
    /// Bank over the given records.
    pub fn new(records: Vec<QuestionRecord>) -> Self {
        Self { records }
    }

    /// Parse a JSON array of question records.
    pub fn from_json_str(json: &str) -> Result<Self, QuestionError> {
        let records: Vec<QuestionRecord> =
            serde_json::from_str(json).map_err(|e| QuestionError::Parse(e.to_string()))?;
        Ok(Self::new(records))
    }

    /// Load a JSON array of question records from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, QuestionError> {
        let json =
            std::fs::read_to_string(path.as_ref()).map_err(|e| QuestionError::Io(e.to_string()))?;
        Self::from_json_str(&json)
    }

    /// Records in the bank.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if the bank holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn pool(&self, request: &QuestionRequest<'_>) -> Vec<&QuestionRecord> {
        let mut seen_ids = HashSet::new();
        let mut seen_text = HashSet::new();

        let mut pool: Vec<&QuestionRecord> = self
            .records
            .iter()
            .filter(|q| request.theme_ids.is_empty() || request.theme_ids.contains(&q.theme_id))
            .filter(|q| match request.difficulty {
                Some(wanted) => {
                    q.difficulty.as_deref().is_some_and(|d| d.eq_ignore_ascii_case(wanted))
                },
                None => true,
            })
            .filter(|q| seen_ids.insert(q.id) && seen_text.insert(normalize(&q.text)))
            .collect();

        // File order must not influence the draw
        pool.sort_by_key(|q| q.id);
        pool
    }
}

impl QuestionSource for QuestionBank {
    fn draw(&self, request: &QuestionRequest<'_>) -> Result<Vec<Question>, QuestionError> {
        let mut pool = self.pool(request);
        if pool.is_empty() || request.count == 0 {
            return Err(QuestionError::Empty);
        }

        let mut rng = game_rng(request.game_id);
        pool.shuffle(&mut rng);
        pool.truncate(request.count);

        Ok(pool.into_iter().map(|record| lay_out(record, &mut rng)).collect())
    }
}

/// RNG seeded from the first 8 bytes of `sha256(game_id)`.
pub fn game_rng(game_id: &str) -> ChaCha8Rng {
    let digest = Sha256::digest(game_id.as_bytes());
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    ChaCha8Rng::seed_from_u64(u64::from_be_bytes(seed))
}

fn lay_out(record: &QuestionRecord, rng: &mut ChaCha8Rng) -> Question {
    let correct = record.correct_answer.trim().to_string();

    let mut options = Vec::with_capacity(1 + MAX_WRONG_OPTIONS);
    options.push(correct.clone());
    for wrong in &record.wrong_answers {
        if options.len() > MAX_WRONG_OPTIONS {
            break;
        }
        let wrong = wrong.trim();
        if !wrong.is_empty() && !options.iter().any(|o| o.eq_ignore_ascii_case(wrong)) {
            options.push(wrong.to_string());
        }
    }
    options.shuffle(rng);

    let correct_index = options.iter().position(|o| *o == correct).unwrap_or(0);

    Question {
        id: record.id,
        theme_id: record.theme_id,
        theme_name: record.theme_name.clone(),
        text: record.text.clone(),
        options,
        correct_index,
        reference: record.reference.clone(),
        difficulty: record.difficulty.clone(),
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}
