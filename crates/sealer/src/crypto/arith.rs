//! Modular arithmetic kernel: exponentiation, inverses and prime search.
//!
//! All values are arbitrary-precision [`BigUint`]s, so `modulus * modulus`
//! never overflows before reduction whatever the key size.

use common::SealError;
use num_bigint::{BigInt, BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::Rng;
use thiserror::Error;

/// Default number of Miller–Rabin rounds.
pub const DEFAULT_MR_ROUNDS: usize = 20;

/// Candidates tried by [`generate_prime`] before giving up.
pub const MAX_PRIME_ATTEMPTS: usize = 10_000;

const SMALL_PRIMES: [u32; 15] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47];

/// Errors produced by the arithmetic kernel.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArithError {
    /// A modulus of zero was supplied.
    #[error("modulus must be non-zero")]
    ZeroModulus,

    /// `gcd(value, modulus) != 1`, so no inverse exists.
    #[error("{value} has no inverse modulo {modulus}")]
    NoInverse { value: String, modulus: String },

    /// No prime was found within [`MAX_PRIME_ATTEMPTS`] candidates.
    #[error("no {bits}-bit prime found after {attempts} candidates")]
    PrimeSearchExhausted { bits: u64, attempts: usize },

    /// Prime search was asked for fewer than two bits.
    #[error("prime bit length must be at least 2, got {0}")]
    InvalidBitLength(u64),
}

impl From<ArithError> for SealError {
    fn from(e: ArithError) -> Self {
        match e {
            ArithError::NoInverse { .. } => SealError::NoInverse(e.to_string()),
            ArithError::ZeroModulus => SealError::Configuration(e.to_string()),
            ArithError::PrimeSearchExhausted { .. } | ArithError::InvalidBitLength(_) => {
                SealError::KeyGeneration(e.to_string())
            }
        }
    }
}

/// Compute `base^exponent mod modulus` by iterative square-and-multiply.
///
/// Every product is reduced modulo `modulus`, so intermediates stay below
/// `modulus^2`. Runs in `O(log exponent)` multiplications.
///
/// # Errors
///
/// Returns [`ArithError::ZeroModulus`] if `modulus` is zero.
pub fn mod_pow(base: &BigUint, exponent: &BigUint, modulus: &BigUint) -> Result<BigUint, ArithError> {
    if modulus.is_zero() {
        return Err(ArithError::ZeroModulus);
    }
    if modulus.is_one() {
        return Ok(BigUint::zero());
    }

    let mut result = BigUint::one();
    let mut square = base % modulus;
    let bits = exponent.bits();
    for i in 0..bits {
        if exponent.bit(i) {
            result = (&result * &square) % modulus;
        }
        if i + 1 < bits {
            square = (&square * &square) % modulus;
        }
    }
    Ok(result)
}

/// Return `d` such that `value * d ≡ 1 (mod modulus)`.
///
/// Uses the extended Euclidean algorithm.
///
/// # Errors
///
/// Returns [`ArithError::NoInverse`] when `gcd(value, modulus) != 1` and
/// [`ArithError::ZeroModulus`] when `modulus` is zero.
pub fn mod_inverse(value: &BigUint, modulus: &BigUint) -> Result<BigUint, ArithError> {
    if modulus.is_zero() {
        return Err(ArithError::ZeroModulus);
    }
    let a = BigInt::from(value.clone());
    let m = BigInt::from(modulus.clone());
    let ext = a.extended_gcd(&m);
    if !ext.gcd.is_one() {
        return Err(ArithError::NoInverse {
            value: value.to_string(),
            modulus: modulus.to_string(),
        });
    }
    // mod_floor keeps the result in [0, modulus).
    ext.x
        .mod_floor(&m)
        .to_biguint()
        .ok_or_else(|| ArithError::NoInverse {
            value: value.to_string(),
            modulus: modulus.to_string(),
        })
}

/// Miller–Rabin probabilistic primality test with `rounds` random bases.
pub fn is_probable_prime<R: Rng + ?Sized>(n: &BigUint, rounds: usize, rng: &mut R) -> bool {
    let two = BigUint::from(2u32);
    if *n < two {
        return false;
    }
    for p in SMALL_PRIMES {
        let p = BigUint::from(p);
        if *n == p {
            return true;
        }
        if (n % &p).is_zero() {
            return false;
        }
    }

    // n - 1 = 2^r * d with d odd.
    let n_minus_one = n - 1u32;
    let r = n_minus_one.trailing_zeros().unwrap_or(0);
    let d = &n_minus_one >> r;

    'witness: for _ in 0..rounds {
        let a = rng.gen_biguint_range(&two, &n_minus_one);
        let mut x = a.modpow(&d, n);
        if x.is_one() || x == n_minus_one {
            continue;
        }
        for _ in 1..r {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Draw a random prime of exactly `bits` bits.
///
/// # Errors
///
/// Returns [`ArithError::InvalidBitLength`] for `bits < 2` and
/// [`ArithError::PrimeSearchExhausted`] if no candidate passes within
/// [`MAX_PRIME_ATTEMPTS`] draws.
pub fn generate_prime<R: Rng + ?Sized>(bits: u64, rounds: usize, rng: &mut R) -> Result<BigUint, ArithError> {
    if bits < 2 {
        return Err(ArithError::InvalidBitLength(bits));
    }
    for _ in 0..MAX_PRIME_ATTEMPTS {
        let mut candidate = rng.gen_biguint(bits);
        candidate.set_bit(bits - 1, true);
        candidate.set_bit(0, true);
        if is_probable_prime(&candidate, rounds, rng) {
            return Ok(candidate);
        }
    }
    Err(ArithError::PrimeSearchExhausted {
        bits,
        attempts: MAX_PRIME_ATTEMPTS,
    })
}

/// `true` when `gcd(a, b) == 1`.
pub fn coprime(a: &BigUint, b: &BigUint) -> bool {
    a.gcd(b).is_one()
}
