//! Harvests materials metadata from several public databases, normalizes the
//! provider-specific schemas into one record shape, and reconciles records
//! across sources on a canonical (formula, space group) key.

pub mod canonical;
pub mod config;
pub mod domain;
pub mod error;
pub mod filter;
pub mod icsd;
pub mod matcher;
pub mod mp;
pub mod nemad;
pub mod output;
pub mod pipeline;
pub mod retry;
pub mod schema;
pub mod seed;
