//! Passcode hashing and identifier generation.
//!
//! Two passcode hash generations exist on the wire. Every request that
//! proves knowledge of a passcode carries both, so relays and peers on
//! either protocol revision can validate it. Neither hash is a security
//! boundary; they only keep plaintext passcodes off the relay.

use crate::utils::{Result, ValidationError};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

/// Identifier alphabet; 0/O and 1/I are excluded
pub const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Session id length
pub const SESSION_ID_LEN: usize = 6;

/// Passcode length
pub const PASSCODE_LEN: usize = 4;

/// Friend code (anonymous handle) length, without the separator
pub const FRIEND_CODE_LEN: usize = 8;

/// Session token size in bytes
pub const SESSION_TOKEN_BYTES: usize = 16;

const PASSCODE_SALT: &[u8] = b"zkchat-passcode-v2:";
const FNV_PRIME: u32 = 0x0100_0193;
const LANE_A_OFFSET: u32 = 0x811c_9dc5;
const LANE_B_OFFSET: u32 = 0x8422_2325;
const DJB2_SEED: u32 = 5381;

fn normalize(passcode: &str) -> String {
    passcode.trim().to_uppercase()
}

/// Current passcode hash: salted two-lane FNV-1a, 16 uppercase hex chars.
///
/// Empty (or whitespace-only) input yields an empty string.
pub fn hash_passcode(passcode: &str) -> String {
    let normalized = normalize(passcode);
    if normalized.is_empty() {
        return String::new();
    }

    let mut lane_a = LANE_A_OFFSET;
    let mut lane_b = LANE_B_OFFSET;
    for &byte in PASSCODE_SALT.iter().chain(normalized.as_bytes()) {
        lane_a ^= u32::from(byte);
        lane_a = lane_a.wrapping_mul(FNV_PRIME);

        lane_b ^= u32::from(byte);
        lane_b = lane_b.wrapping_mul(FNV_PRIME);
        lane_b ^= lane_b >> 13;
    }

    format!("{:016X}", (u64::from(lane_a) << 32) | u64::from(lane_b))
}

/// Legacy passcode hash: unsalted 32-bit DJB2, rendered as decimal.
pub fn hash_passcode_legacy(passcode: &str) -> String {
    let normalized = normalize(passcode);
    if normalized.is_empty() {
        return String::new();
    }

    let hash = normalized.bytes().fold(DJB2_SEED, |h, b| {
        (h << 5).wrapping_add(h).wrapping_add(u32::from(b))
    });
    hash.to_string()
}

/// Both passcode hash generations, as emitted on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasscodeHashes {
    /// Current-generation hash
    pub current: String,
    /// Legacy hash; absent when only a pre-hashed invitation is known
    pub legacy: Option<String>,
}

impl PasscodeHashes {
    /// Derive both hashes from a plaintext passcode
    pub fn from_passcode(passcode: &str) -> Self {
        Self {
            current: hash_passcode(passcode),
            legacy: Some(hash_passcode_legacy(passcode)),
        }
    }

    /// Wrap hashes received from an invitation
    pub fn prehashed(current: String, legacy: Option<String>) -> Self {
        Self { current, legacy }
    }
}

fn random_code(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| char::from(ALPHABET[rng.gen_range(0..ALPHABET.len())]))
        .collect()
}

/// Generate a 6-character session id
pub fn generate_session_id() -> String {
    random_code(SESSION_ID_LEN)
}

/// Generate a 4-character passcode
pub fn generate_passcode() -> String {
    random_code(PASSCODE_LEN)
}

/// Generate an anonymous handle, which doubles as the friend code
pub fn generate_handle() -> String {
    random_code(FRIEND_CODE_LEN)
}

/// Generate a 16-byte session token, hex encoded
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; SESSION_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn in_alphabet(s: &str) -> bool {
    s.bytes().all(|b| ALPHABET.contains(&b))
}

// Hand-picked ids may use any letter or digit; only generation is restricted.
fn is_code_text(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Validate and normalize a session id
pub fn parse_session_id(input: &str) -> Result<String> {
    let id = normalize(input);
    if !is_code_text(&id, SESSION_ID_LEN) {
        return Err(ValidationError::MalformedSessionId {
            hint: format!("expected {SESSION_ID_LEN} letters or digits"),
        }
        .into());
    }
    Ok(id)
}

/// Validate and normalize a passcode
pub fn parse_passcode(input: &str) -> Result<String> {
    let passcode = normalize(input);
    if !is_code_text(&passcode, PASSCODE_LEN) {
        return Err(ValidationError::MalformedPasscode {
            hint: format!("expected {PASSCODE_LEN} letters or digits"),
        }
        .into());
    }
    Ok(passcode)
}

/// A parsed `SESSIONID-PASSCODE` join code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCode {
    /// Session id part
    pub session_id: String,
    /// Plaintext passcode part
    pub passcode: String,
}

impl JoinCode {
    /// Combined display form
    pub fn to_code(&self) -> String {
        format!("{}-{}", self.session_id, self.passcode)
    }
}

impl std::fmt::Display for JoinCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_code())
    }
}

/// Parse a join code in `ABC123-WXYZ` or `ABC123WXYZ` form
pub fn parse_join_code(input: &str) -> Result<JoinCode> {
    let malformed = || ValidationError::MalformedJoinCode {
        hint: "expected SESSIONID-PASSCODE, e.g. ABC123-WXYZ".to_string(),
    };

    let code = normalize(input);
    let (session_part, passcode_part) = match code.len() {
        11 if code.as_bytes()[SESSION_ID_LEN] == b'-' => {
            (&code[..SESSION_ID_LEN], &code[SESSION_ID_LEN + 1..])
        }
        10 if code.is_ascii() => code.split_at(SESSION_ID_LEN),
        _ => return Err(malformed().into()),
    };

    let session_id = parse_session_id(session_part).map_err(|_| malformed())?;
    let passcode = parse_passcode(passcode_part).map_err(|_| malformed())?;
    Ok(JoinCode {
        session_id,
        passcode,
    })
}

/// Parse a friend code in `XXXX-XXXX` or `XXXXXXXX` form into a handle
pub fn parse_friend_code(input: &str) -> Result<String> {
    let code: String = normalize(input).chars().filter(|c| *c != '-').collect();
    if code.len() != FRIEND_CODE_LEN || !in_alphabet(&code) {
        return Err(ValidationError::MalformedFriendCode {
            hint: "expected 8 characters such as ABCD-EFGH".to_string(),
        }
        .into());
    }
    Ok(code)
}

/// Render a handle as a friend code
pub fn format_friend_code(handle: &str) -> String {
    if handle.len() == FRIEND_CODE_LEN && handle.is_ascii() {
        format!("{}-{}", &handle[..4], &handle[4..])
    } else {
        handle.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_normalization() {
        let h = hash_passcode("AB12");
        assert_eq!(h, hash_passcode("ab12"));
        assert_eq!(h, hash_passcode(" ab12 "));
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_hash_known_values() {
        assert_eq!(hash_passcode("AB12"), "1C62F0EC260E5CE1");
        assert_eq!(hash_passcode("WXYZ"), "E2D493D075C01F70");
        assert_eq!(hash_passcode_legacy("AB12"), "2088883051");
        assert_eq!(hash_passcode_legacy(" wxyz"), "2089698983");
    }

    #[test]
    fn test_empty_passcode_is_not_hashed() {
        assert_eq!(hash_passcode(""), "");
        assert_eq!(hash_passcode("   "), "");
        assert_eq!(hash_passcode_legacy(""), "");
    }

    #[test]
    fn test_dual_hashes_from_passcode() {
        let hashes = PasscodeHashes::from_passcode("wxyz");
        assert_eq!(hashes.current, hash_passcode("WXYZ"));
        assert_eq!(hashes.legacy.as_deref(), Some(hash_passcode_legacy("WXYZ").as_str()));
    }

    #[test]
    fn test_generated_codes_use_alphabet() {
        for _ in 0..50 {
            let id = generate_session_id();
            assert_eq!(id.len(), SESSION_ID_LEN);
            assert!(parse_session_id(&id).is_ok());

            let passcode = generate_passcode();
            assert!(parse_passcode(&passcode).is_ok());
            assert!(!passcode.contains(['0', 'O', '1', 'I']));
        }
    }

    #[test]
    fn test_session_tokens_are_unique() {
        let a = generate_session_token();
        let b = generate_session_token();
        assert_eq!(a.len(), SESSION_TOKEN_BYTES * 2);
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_join_code() {
        let code = parse_join_code("ABC234-WXYZ").unwrap();
        assert_eq!(code.session_id, "ABC234");
        assert_eq!(code.passcode, "WXYZ");

        assert_eq!(parse_join_code(" abc234wxyz ").unwrap(), code);
        assert_eq!(code.to_string(), "ABC234-WXYZ");

        // Hand-picked ids are not limited to the generation alphabet
        let picked = parse_join_code("ABC123-WXYZ").unwrap();
        assert_eq!(picked.session_id, "ABC123");
        assert_eq!(parse_join_code("abc10i0o1i").unwrap().to_code(), "ABC10I-0O1I");
        assert_eq!(parse_session_id("ABC123").unwrap(), "ABC123");
        assert_eq!(parse_passcode("10OI").unwrap(), "10OI");
    }

    #[test]
    fn test_parse_join_code_rejects_bad_input() {
        for bad in ["", "ABC234", "ABC234-WXY", "ABC234_WXYZ", "ABC!23-WXYZ", "ABC234-WXYZZ", "ÄBC234WXYZ"] {
            let err = parse_join_code(bad).unwrap_err();
            assert!(err.is_user_facing(), "{bad}");
        }
    }

    #[test]
    fn test_friend_codes() {
        let handle = generate_handle();
        let display = format_friend_code(&handle);
        assert_eq!(display.len(), 9);
        assert_eq!(parse_friend_code(&display).unwrap(), handle);
        assert_eq!(parse_friend_code(&display.to_lowercase()).unwrap(), handle);
        assert!(parse_friend_code("ABCD-EFG").is_err());
        assert!(parse_friend_code("ABCD-EFG0").is_err());
    }
}
