// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use crate::message::Message;
use crate::Error;

/// Hooks invoked around the codec by the transport.
///
/// Implementations own session state and any proxy-id bookkeeping; the
/// transport only reacts to the errors they surface. On the confirmable
/// send path, [`Error::SessionExpired`] and [`Error::SessionNotFound`] are
/// recovered exactly once by performing another [`handshake`] and retrying
/// the send.
///
/// [`handshake`]: SecurityLayer::handshake
pub trait SecurityLayer<A>: Send + Sync {
    /// Establishes (or re-establishes) a session with `peer`.
    ///
    /// Called before a secure confirmable exchange. Implementations should
    /// treat an already-established session as a no-op.
    fn handshake(&self, peer: A, proxy_addr: Option<&str>) -> Result<(), Error>;

    /// Transforms an outbound message in place, e.g. by encrypting its
    /// payload and options, just before it is encoded.
    fn security_output(&self, message: &mut Message, peer: A) -> Result<(), Error>;

    /// Transforms an inbound message in place just after it is decoded.
    fn security_input(&self, message: &mut Message, proxy_addr: Option<&str>) -> Result<(), Error>;
}

/// A [`SecurityLayer`] that passes every message through untouched.
#[derive(Debug, Default, Copy, Clone)]
pub struct PlainSecurity;

impl<A> SecurityLayer<A> for PlainSecurity {
    fn handshake(&self, _peer: A, _proxy_addr: Option<&str>) -> Result<(), Error> {
        Ok(())
    }

    fn security_output(&self, _message: &mut Message, _peer: A) -> Result<(), Error> {
        Ok(())
    }

    fn security_input(&self, _message: &mut Message, _proxy_addr: Option<&str>) -> Result<(), Error> {
        Ok(())
    }
}
