use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Participant tokens
// ---------------------------------------------------------------------------

/// Claims carried by a participant token.
///
/// A token binds one participant identity to one room for roughly an hour.
/// It is never persisted server-side — validity is purely cryptographic
/// (HS256 signature + expiry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Participant ID (UUID).
    pub sub: String,
    pub room_id: String,
    /// Display name shown to other participants.
    pub name: String,
    /// Whether this participant created the room.
    pub host: bool,
    /// Issued-at (unix timestamp).
    pub iat: usize,
    /// Expiration (unix timestamp).
    pub exp: usize,
}

/// Create a signed token for a participant of the given room.
pub fn create_token(
    secret: &str,
    room_id: &str,
    participant_id: &str,
    display_name: &str,
    is_host: bool,
    ttl_secs: u64,
) -> Result<String> {
    let now = chrono::Utc::now().timestamp() as usize;

    let claims = Claims {
        sub: participant_id.to_string(),
        room_id: room_id.to_string(),
        name: display_name.to_string(),
        host: is_host,
        iat: now,
        exp: now + ttl_secs as usize,
    };

    encode(
        &Header::default(), // HS256
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| Error::internal(format!("token signing failed: {e}")))
}

/// Verify and decode a participant token, returning the inner claims.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(), // HS256 + exp validation
    )
    .map_err(|e| Error::unauthorized(format!("invalid or expired token: {e}")))?;
    Ok(token_data.claims)
}

// ---------------------------------------------------------------------------
// Room credentials
// ---------------------------------------------------------------------------

pub fn hash_credential(credential: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(credential.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| Error::internal(format!("credential hashing failed: {e}")))
}

pub fn verify_credential(credential: &str, hash: &str) -> Result<bool> {
    let parsed_hash =
        PasswordHash::new(hash).map_err(|e| Error::internal(format!("invalid credential hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(credential.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Strength policy applied before a credential is accepted at room creation.
pub fn validate_credential(credential: &str, min_len: usize) -> Result<()> {
    if credential.len() < min_len {
        return Err(Error::validation(format!(
            "credential must be at least {min_len} characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Display names
// ---------------------------------------------------------------------------

const ADJECTIVES: &[&str] = &[
    "Happy", "Swift", "Bright", "Calm", "Cool", "Kind", "Wise", "Brave",
    "Lucky", "Eager", "Bold", "Fair", "Free", "Glad", "Keen", "Nice",
];

const ANIMALS: &[&str] = &[
    "Panda", "Eagle", "Tiger", "Lion", "Bear", "Wolf", "Fox", "Hawk",
    "Owl", "Cat", "Dog", "Duck", "Deer", "Swan", "Seal", "Crab",
];

/// Generate a random `AdjectiveAnimal` display name for a new participant.
pub fn random_display_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).unwrap_or(&"Happy");
    let animal = ANIMALS.choose(&mut rng).unwrap_or(&"Panda");
    format!("{adjective}{animal}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
