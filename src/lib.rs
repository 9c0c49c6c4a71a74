// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Re-signing of compiled Apple executables.
//!
//! This crate re-signs Mach-O binaries without Apple's own toolchain: it
//! parses a (possibly fat/universal) Mach-O, constructs the embedded
//! code-signing superblob (code directory, requirement expressions,
//! entitlements, CMS signature), and patches it into the `__LINKEDIT` space
//! an unsigned build reserved for it. It is not a linker: load commands are
//! never added, removed, or relocated.
//!
//! The layers, bottom up:
//!
//! * [binary_io]: endian-aware cursors with deferred length/offset fields.
//! * [macho] / [universal]: the Mach-O object model and fat container.
//! * [embedded_signature], [code_directory], [code_requirement],
//!   [code_hash]: the blob hierarchy and digests.
//! * [macho_signing]: the prepare/sign state machine tying together
//!   [bundle], [provisioning], [certificate], and [code_resources].

pub mod binary_io;
pub use binary_io::*;
mod bundle;
pub use bundle::*;
mod certificate;
pub use certificate::*;
mod code_directory;
pub use code_directory::*;
mod code_hash;
pub use code_hash::*;
pub mod code_requirement;
pub use code_requirement::*;
mod code_resources;
pub use code_resources::*;
pub mod embedded_signature;
pub use embedded_signature::*;
mod error;
pub use error::*;
mod macho;
pub use macho::*;
mod macho_signing;
pub use macho_signing::*;
mod provisioning;
pub use provisioning::*;
#[cfg(test)]
pub(crate) mod testcredentials;
mod universal;
pub use universal::*;
