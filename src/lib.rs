//! Core library for mailspool: a scripted bulk mailer.
//!
//! The pipeline has three stages:
//!
//! 1. [`document`] loads YAML config documents, merges defaults,
//!    expands templates and `loop` directives, and validates the
//!    resulting mail descriptors.
//! 2. [`message`] assembles one descriptor into a renderable MIME
//!    message: addresses, body variants, attachments, optional S/MIME
//!    signing/encryption and a DKIM integrity header.
//! 3. [`delivery`] partitions recipients by mailbox domain, resolves
//!    each domain's mail exchange (or uses one fixed relay), and
//!    submits one SMTP transaction per group with classified outcomes.
//!
//! The `mailspool` binary drives the stages over the command line; the
//! library surface keeps every stage usable on its own.

pub mod core;
pub mod delivery;
pub mod document;
pub mod message;

pub use crate::core::config::{tags_match, Config};
pub use crate::core::error::{AppError, Result};
pub use crate::delivery::{DeliveryOutcome, DeliveryStatus, Mailer};
pub use crate::document::{Document, MailDescriptor, TemplateExpander};
pub use crate::message::{Body, Message};
