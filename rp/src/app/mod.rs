// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application layer: the transport-independent logic behind the HTTP
//! endpoints and the background worker.

pub mod deploy;
pub mod operation;
pub mod status;
