//! Certificate templating and policy, the provisioner framework, and the
//! issuance pipeline (`Sign`/`Renew`/`Revoke`) for the Castellan
//! certificate authority.
//!
//! This crate has no HTTP surface of its own — `castellan-acme` and
//! `castellan-scep` call into `authority::Authority` after they've
//! authenticated a request their own way (JWS for ACME, CMS for SCEP).

pub mod authority;
pub mod certbuild;
pub mod crl;
pub mod policy;
pub mod provisioner;
pub mod registry;
pub mod template;

// vim: ts=4
