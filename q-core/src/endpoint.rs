// SPDX-License-Identifier: Apache-2.0

/// Which side of a connection an endpoint is acting as. Used to derive the
/// stream-ID-type bit layout and to decide which connection-ID pool role an
/// endpoint plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Client,
    Server,
}

impl Type {
    pub fn peer_type(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}
