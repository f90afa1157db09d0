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

use std::fmt::{Debug, Display, Formatter};

/// Type for errors encountered while sending or receiving CoAP messages.
#[derive(Debug, Eq, PartialEq, Hash, Copy, Clone)]
pub enum Error {
    /// The message type is not valid for the requested operation.
    UnsupportedType,

    /// The retransmission budget for the exchange has been exhausted.
    MaxAttempts,

    /// The security layer reported that the session has expired.
    SessionExpired,

    /// The security layer could not find a session for the peer.
    SessionNotFound,

    /// The decoder produced no message from the datagram.
    NilMessage,

    /// One or more of the supplied arguments are not valid for the given operation.
    InvalidArgument,

    /// An error was encountered while attempting to parse the data.
    ParseFailure,

    /// The message code was not recognized by this implementation.
    UnknownMessageCode,

    /// An I/O error occurred while performing this operation.
    IOError,

    /// The exchange was abandoned before a result could be produced.
    Cancelled,
}

impl std::convert::From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::IOError
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        <Self as Debug>::fmt(self, f)
    }
}
