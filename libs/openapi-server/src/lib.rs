//! HTTP payload models for the Frost engine API

pub mod models;
