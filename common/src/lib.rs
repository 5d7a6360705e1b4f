// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between the Terrane resource-provider frontend and its
//! background deployment worker
//!
//! Everything in this crate is transport-agnostic: the HTTP layer converts
//! [`error::Error`] into a `dropshot::HttpError` at the very edge of the
//! system and nothing else in the crate knows it is being served over HTTP.

pub mod error;
pub mod output;
pub mod provisioning;
pub mod resource_id;

pub use error::Error;
pub use resource_id::ResourceId;
