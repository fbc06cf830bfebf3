// crypto.rs

use rsa::BigUint;

use crate::constants::MIN_ENCRYPTED_LENGTH;
use crate::error::{MonicaError, Result};

/// The server's persistent RSA public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaKey {
    modulus: BigUint,
    exponent: BigUint,
}

impl RsaKey {
    pub fn new(modulus: BigUint, exponent: BigUint) -> Self {
        Self { modulus, exponent }
    }

    /// Builds the key from the decimal strings the `rsakey` action returns.
    pub fn from_decimal(modulus: &str, exponent: &str) -> Result<Self> {
        let parse = |name: &str, digits: &str| {
            BigUint::parse_bytes(digits.trim().as_bytes(), 10).ok_or_else(|| MonicaError::Encryption {
                message: format!("{} is not a decimal integer", name),
            })
        };
        let modulus = parse("modulus", modulus)?;
        let exponent = parse("exponent", exponent)?;
        if modulus <= BigUint::from(1u32) {
            return Err(MonicaError::Encryption {
                message: "modulus must be greater than one".to_string(),
            });
        }
        Ok(Self { modulus, exponent })
    }

    /// Encrypts `plain_text` for the server and returns the ciphertext in decimal.
    ///
    /// Each UTF-16 code unit contributes its binary form (at least eight bits) to one
    /// big-endian integer, after the text is zero-padded to 40 units. The integer is
    /// raised to the exponent modulo the modulus with no further padding scheme, which
    /// is what the server expects.
    pub fn encrypt(&self, plain_text: &str) -> String {
        self.message_integer(plain_text)
            .modpow(&self.exponent, &self.modulus)
            .to_str_radix(10)
    }

    fn message_integer(&self, plain_text: &str) -> BigUint {
        let mut units: Vec<u16> = plain_text.encode_utf16().collect();
        if units.len() < MIN_ENCRYPTED_LENGTH {
            units.resize(MIN_ENCRYPTED_LENGTH, 0);
        }

        units.into_iter().fold(BigUint::from(0u32), |acc, unit| {
            let bits = (16 - unit.leading_zeros() as usize).max(8);
            (acc << bits) + BigUint::from(unit as u32)
        })
    }
}
