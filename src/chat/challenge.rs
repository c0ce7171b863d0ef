// Arithmetic challenges bound to a signed token
//
// The token payload is the expected answer and carries no expiry of its own:
// a captured token verifies forever, only the cookie transporting it is
// short-lived (`CHALLENGE_TTL`).

use crate::chat::token;
use rand::Rng;
use std::ops::RangeInclusive;
use std::time::Duration;

/// Name of the cookie carrying the challenge token
pub const CHALLENGE_COOKIE: &str = "mochat_captcha";

/// Transport lifetime of a challenge token
pub const CHALLENGE_TTL: Duration = Duration::from_secs(60 * 5);

/// Range both operands are drawn from
const OPERAND_RANGE: RangeInclusive<u32> = 2..=8;

/// A freshly generated challenge
#[derive(Debug, Clone)]
pub struct Challenge {
    /// Human-readable question, e.g. "3 + 5"
    pub question: String,
    /// Signed expected answer
    pub token: String,
}

/// Issues and checks challenges
#[derive(Clone)]
pub struct ChallengeManager {
    secret: Vec<u8>,
}

impl ChallengeManager {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Generate a challenge using the thread-local RNG
    pub fn generate(&self) -> Challenge {
        self.generate_with(&mut rand::thread_rng())
    }

    /// Generate a challenge from the given RNG
    pub fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Challenge {
        let left = rng.gen_range(OPERAND_RANGE);
        let right = rng.gen_range(OPERAND_RANGE);
        self.issue(left, right)
    }

    /// Build the challenge for a fixed pair of operands
    pub fn issue(&self, left: u32, right: u32) -> Challenge {
        let answer = (left + right).to_string();
        Challenge {
            question: format!("{left} + {right}"),
            token: token::sign(answer.as_bytes(), &self.secret),
        }
    }

    /// Check a submitted answer against a challenge token
    ///
    /// The answer is trimmed and compared as a string, so "08" does not match
    /// "8". Only the token signature check needs to be constant-time.
    pub fn verify(&self, answer: &str, token: Option<&str>) -> bool {
        let Some(token) = token else {
            return false;
        };
        let Ok(expected) = token::verify(token, &self.secret) else {
            return false;
        };
        expected == answer.trim().as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn manager() -> ChallengeManager {
        ChallengeManager::new("captcha-secret")
    }

    #[test]
    fn test_question_and_answer() {
        let challenges = manager();
        let challenge = challenges.issue(3, 5);
        assert_eq!(challenge.question, "3 + 5");

        assert!(challenges.verify("8", Some(&challenge.token)));
        assert!(challenges.verify(" 8 ", Some(&challenge.token)));
        assert!(!challenges.verify("08", Some(&challenge.token)));
        assert!(!challenges.verify("9", Some(&challenge.token)));
        assert!(!challenges.verify("", Some(&challenge.token)));
    }

    #[test]
    fn test_missing_or_foreign_token() {
        let challenges = manager();
        let foreign = ChallengeManager::new("other").issue(3, 5);

        assert!(!challenges.verify("8", None));
        assert!(!challenges.verify("8", Some(&foreign.token)));
        assert!(!challenges.verify("8", Some("garbage")));
    }

    #[test]
    fn test_generated_operands_in_range() {
        let challenges = manager();
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let challenge = challenges.generate_with(&mut rng);
            let (left, right) = challenge.question.split_once(" + ").unwrap();
            let left: u32 = left.parse().unwrap();
            let right: u32 = right.parse().unwrap();
            assert!(OPERAND_RANGE.contains(&left));
            assert!(OPERAND_RANGE.contains(&right));

            let answer = (left + right).to_string();
            assert!(challenges.verify(&answer, Some(&challenge.token)));
        }
    }

    #[test]
    fn test_token_stays_verifiable() {
        // No expiry inside the token: only the cookie bounds its lifetime
        let challenges = manager();
        let challenge = challenges.issue(2, 2);
        assert!(challenges.verify("4", Some(&challenge.token)));
        assert!(challenges.verify("4", Some(&challenge.token)));
    }
}
