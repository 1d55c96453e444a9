//! # rushbuy
//!
//! Multi-account purchase scheduler for rate-limited, bot-hostile shop
//! APIs, with a pool of pre-solved slider verification tokens.
//!
//! The [`engine`] drives timed ("rush") and periodic ("scan") purchase
//! attempts under global and per-account limits without over-buying. The
//! [`captcha`] module keeps verification tokens ready, solving slider
//! challenges on pooled browser pages through an external breaking service.
//! Persistence, the shop API and notifications sit behind the [`store`],
//! [`provider`] and [`notify`] traits.

pub mod captcha;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod notify;
pub mod provider;
pub mod store;
pub mod telemetry;
