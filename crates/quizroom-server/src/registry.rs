//! Room registry.
//!
//! Maps room codes and game ids to rooms, and player ids to the game they are
//! seated in. Room codes are human-readable and may be reused once a room is
//! dropped; game ids are minted once and never reused.
//!
//! The registry holds handles only. It never locks a room, so callers can
//! look a room up under the registry lock and release it before touching the
//! room.

use std::collections::HashMap;

use quizroom_core::Environment;

use crate::room::RoomError;

/// Characters in a room code.
pub const ROOM_CODE_LEN: usize = 6;

/// Room code alphabet.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Attempts at finding an unused code before giving up.
pub const MAX_CODE_ATTEMPTS: usize = 32;

/// Registry of live rooms.
#[derive(Debug)]
pub struct RoomRegistry<H> {
    /// Game id → room handle
    rooms: HashMap<String, H>,
    /// Room code → game id
    codes: HashMap<String, String>,
    /// Player id → game id of their seat
    players: HashMap<String, String>,
}

impl<H> Default for RoomRegistry<H> {
    fn default() -> Self {
        Self { rooms: HashMap::new(), codes: HashMap::new(), players: HashMap::new() }
    }
}

impl<H: Clone> RoomRegistry<H> {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw an unused room code.
    ///
    /// # Errors
    ///
    /// `RoomError::Internal` if no free code was found in
    /// [`MAX_CODE_ATTEMPTS`] draws.
    pub fn allocate_code<E: Environment>(&self, env: &E) -> Result<String, RoomError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_code(env);
            if !self.codes.contains_key(&code) {
                return Ok(code);
            }
        }
        Err(RoomError::Internal("room code space exhausted".to_string()))
    }

    /// Mint a game id: 32 hex characters from the environment RNG.
    pub fn mint_game_id<E: Environment>(&self, env: &E) -> Result<String, RoomError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let id = format!("{:032x}", env.random_u128());
            if !self.rooms.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(RoomError::Internal("game id collision".to_string()))
    }

    /// Register a room under its code and game id.
    pub fn insert(&mut self, room_code: &str, game_id: &str, handle: H) {
        self.codes.insert(room_code.to_string(), game_id.to_string());
        self.rooms.insert(game_id.to_string(), handle);
    }

    /// Room by user-entered code. Case-insensitive and whitespace-tolerant.
    pub fn lookup_by_code(&self, room_code: &str) -> Option<H> {
        let code = normalize_code(room_code);
        let game_id = self.codes.get(&code)?;
        self.rooms.get(game_id).cloned()
    }

    /// Room by game id.
    pub fn lookup_by_game(&self, game_id: &str) -> Option<H> {
        self.rooms.get(game_id).cloned()
    }

    /// Game the player is seated in.
    pub fn seat_of(&self, player_id: &str) -> Option<&str> {
        self.players.get(player_id).map(String::as_str)
    }

    /// Record the player's seat, returning the game they were seated in
    /// before, if any.
    pub fn seat(&mut self, player_id: &str, game_id: &str) -> Option<String> {
        self.players.insert(player_id.to_string(), game_id.to_string())
    }

    /// Forget the player's seat, but only if it is in `game_id`.
    pub fn unseat(&mut self, player_id: &str, game_id: &str) {
        if self.players.get(player_id).is_some_and(|g| g == game_id) {
            self.players.remove(player_id);
        }
    }

    /// Remove a room and every seat pointing at it. Idempotent.
    pub fn drop_room(&mut self, game_id: &str) -> Option<H> {
        let handle = self.rooms.remove(game_id)?;
        self.codes.retain(|_, g| g != game_id);
        self.players.retain(|_, g| g != game_id);
        Some(handle)
    }

    /// Live rooms.
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// True if no room is live.
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Handles of every live room.
    pub fn handles(&self) -> Vec<H> {
        self.rooms.values().cloned().collect()
    }
}

/// Uppercase and strip whitespace.
pub fn normalize_code(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).map(|c| c.to_ascii_uppercase()).collect()
}

fn generate_code<E: Environment>(env: &E) -> String {
    let mut bytes = [0u8; ROOM_CODE_LEN];
    env.random_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| char::from(ROOM_CODE_ALPHABET[usize::from(*b) % ROOM_CODE_ALPHABET.len()]))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU8, Ordering},
        },
        time::{Duration, Instant},
    };

    use super::*;

    /// Fills buffers with a fixed byte, then a counter once `fixed` reaches 0.
    #[derive(Clone)]
    struct ByteEnv {
        fixed: Arc<AtomicU8>,
        next: Arc<AtomicU8>,
    }

    impl ByteEnv {
        fn repeating(times: u8) -> Self {
            Self { fixed: Arc::new(AtomicU8::new(times)), next: Arc::new(AtomicU8::new(1)) }
        }
    }

    impl Environment for ByteEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            Instant::now()
        }

        fn wall_clock_millis(&self) -> u64 {
            0
        }

        async fn sleep(&self, _duration: Duration) {}

        fn random_bytes(&self, buffer: &mut [u8]) {
            let remaining = self.fixed.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fixed.store(remaining - 1, Ordering::SeqCst);
                buffer.fill(0);
            } else {
                buffer.fill(self.next.fetch_add(1, Ordering::SeqCst));
            }
        }
    }

    #[test]
    fn codes_use_alphabet() {
        let registry: RoomRegistry<u32> = RoomRegistry::new();
        let code = registry.allocate_code(&ByteEnv::repeating(0)).unwrap();
        assert_eq!(code.len(), ROOM_CODE_LEN);
        assert!(code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn collision_redraws() {
        let mut registry = RoomRegistry::new();
        registry.insert("AAAAAA", "g1", 1u32);

        let code = registry.allocate_code(&ByteEnv::repeating(3)).unwrap();
        assert_ne!(code, "AAAAAA");
    }

    #[test]
    fn exhausted_code_space_is_internal() {
        let mut registry = RoomRegistry::new();
        registry.insert("AAAAAA", "g1", 1u32);

        let env = ByteEnv::repeating(u8::MAX);
        assert!(matches!(registry.allocate_code(&env), Err(RoomError::Internal(_))));
    }

    #[test]
    fn lookup_normalizes_code() {
        let mut registry = RoomRegistry::new();
        registry.insert("ABC123", "g1", 7u32);

        assert_eq!(registry.lookup_by_code(" abc123 "), Some(7));
        assert_eq!(registry.lookup_by_game("g1"), Some(7));
        assert_eq!(registry.lookup_by_code("ZZZZZZ"), None);
    }

    #[test]
    fn unseat_only_matching_game() {
        let mut registry = RoomRegistry::<u32>::new();
        registry.seat("p1", "g1");
        registry.unseat("p1", "g2");
        assert_eq!(registry.seat_of("p1"), Some("g1"));

        assert_eq!(registry.seat("p1", "g2"), Some("g1".to_string()));
        registry.unseat("p1", "g2");
        assert_eq!(registry.seat_of("p1"), None);
    }

    #[test]
    fn drop_room_clears_code_and_seats() {
        let mut registry = RoomRegistry::new();
        registry.insert("ABC123", "g1", 1u32);
        registry.seat("p1", "g1");

        assert_eq!(registry.drop_room("g1"), Some(1));
        assert_eq!(registry.drop_room("g1"), None);
        assert!(registry.lookup_by_code("ABC123").is_none());
        assert!(registry.seat_of("p1").is_none());
        assert!(registry.is_empty());
    }
}
