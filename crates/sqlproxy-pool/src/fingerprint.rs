//! Connection fingerprint: the pool's deduplication key.
//!
//! A SHA-256 digest over a canonical JSON encoding of every connection
//! parameter, password included. Records store the digest only, so equal
//! credentials can be matched without keeping or comparing passwords.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{PoolError, PoolResult};
use crate::params::{ConnectionParams, Engine};

/// Canonical field order for hashing. Changing it changes every fingerprint.
#[derive(Serialize)]
struct Canonical<'a> {
    engine: String,
    host: &'a str,
    port: u16,
    user: &'a str,
    password: &'a str,
    database: &'a str,
    ssl: bool,
}

/// 256-bit digest identifying equivalent connection parameters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of `params`.
    ///
    /// Engine aliases (`postgresql`, `mssql`, ...) hash like their canonical
    /// name so they deduplicate together.
    pub fn compute(params: &ConnectionParams) -> PoolResult<Self> {
        let engine = match params.db_type.parse::<Engine>() {
            Ok(engine) => engine.as_str().to_string(),
            Err(_) => params.db_type.trim().to_ascii_lowercase(),
        };
        let canonical = Canonical {
            engine,
            host: &params.host,
            port: params.port,
            user: &params.user,
            password: &params.password,
            database: &params.db_name,
            ssl: params.ssl,
        };
        let encoded = serde_json::to_vec(&canonical).map_err(|e| PoolError::Hash(e.to_string()))?;
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(&encoded));
        Ok(Self(digest))
    }

    /// Hex rendering for diagnostics and tests. Not for logs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Fingerprint(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ConnectionParams {
        ConnectionParams::new(Engine::Postgres, "db.local", "app", "s3cret", "main")
    }

    #[test]
    fn deterministic_for_equal_params() {
        let a = Fingerprint::compute(&params()).unwrap();
        let b = Fingerprint::compute(&params().clone()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn stable_across_runs() {
        // Pinned digest: must not change between builds or process restarts.
        let fp = Fingerprint::compute(&params()).unwrap();
        assert_eq!(
            fp.to_hex(),
            "c72b436b1c6173651c383591f52936aaa20852b5fc82d0e26fbf9c6cd7deac60"
        );
    }

    #[test]
    fn every_field_changes_the_digest() {
        let base = Fingerprint::compute(&params()).unwrap();
        let variants = [
            ConnectionParams {
                db_type: "mysql".into(),
                ..params()
            },
            ConnectionParams {
                host: "db2.local".into(),
                ..params()
            },
            ConnectionParams {
                port: 5433,
                ..params()
            },
            ConnectionParams {
                user: "other".into(),
                ..params()
            },
            ConnectionParams {
                password: "s3cret!".into(),
                ..params()
            },
            ConnectionParams {
                db_name: "other".into(),
                ..params()
            },
            ConnectionParams {
                ssl: true,
                ..params()
            },
        ];
        for variant in variants {
            let fp = Fingerprint::compute(&variant).unwrap();
            assert_ne!(fp, base, "{variant:?} should not collide");
        }
    }

    #[test]
    fn engine_aliases_share_a_fingerprint() {
        let canonical = Fingerprint::compute(&params()).unwrap();
        let alias = Fingerprint::compute(&ConnectionParams {
            db_type: "PostgreSQL".into(),
            ..params()
        })
        .unwrap();
        assert_eq!(canonical, alias);
    }

    #[test]
    fn field_boundaries_are_unambiguous() {
        let a = ConnectionParams {
            user: "ab".into(),
            password: "c".into(),
            ..params()
        };
        let b = ConnectionParams {
            user: "a".into(),
            password: "bc".into(),
            ..params()
        };
        assert_ne!(
            Fingerprint::compute(&a).unwrap(),
            Fingerprint::compute(&b).unwrap()
        );
    }

    #[test]
    fn debug_does_not_leak_digest() {
        let fp = Fingerprint::compute(&params()).unwrap();
        assert_eq!(format!("{fp:?}"), "Fingerprint(..)");
    }
}
