// SPDX-License-Identifier: Apache-2.0

//! Defines the QUIC connection ID (RFC 9000 §5.1). Each endpoint selects the
//! connection IDs its peer uses, independently from the IDs it itself is
//! addressed by.

use core::{convert::TryFrom, fmt};

/// The maximum length of a connection ID permitted by QUIC v1.
pub const MAX_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    InvalidLength,
}

macro_rules! id {
    ($type:ident, $min_len:expr) => {
        /// Uniquely identifies a QUIC connection from one peer's perspective.
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $type {
            bytes: [u8; MAX_LEN],
            len: u8,
        }

        impl fmt::Debug for $type {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($type), self.as_bytes())
            }
        }

        impl $type {
            pub const MIN_LEN: usize = $min_len;

            #[inline]
            pub fn try_from_bytes(bytes: &[u8]) -> Option<$type> {
                Self::try_from(bytes).ok()
            }

            #[inline]
            pub fn as_bytes(&self) -> &[u8] {
                self.as_ref()
            }

            #[inline]
            pub const fn len(&self) -> usize {
                self.len as usize
            }

            #[inline]
            pub fn is_empty(&self) -> bool {
                self.len == 0
            }
        }

        impl TryFrom<&[u8]> for $type {
            type Error = Error;

            #[inline]
            fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
                let len = slice.len();
                if !($type::MIN_LEN..=MAX_LEN).contains(&len) {
                    return Err(Error::InvalidLength);
                }
                let mut bytes = [0; MAX_LEN];
                bytes[..len].copy_from_slice(slice);
                Ok(Self {
                    bytes,
                    len: len as u8,
                })
            }
        }

        impl AsRef<[u8]> for $type {
            #[inline]
            fn as_ref(&self) -> &[u8] {
                &self.bytes[0..self.len as usize]
            }
        }
    };
}

id!(LocalId, 0);
id!(PeerId, 1);

/// 16-byte secret exchanged alongside each connection ID, used by a peer to
/// signal "I no longer recognize this connection" without access to the
/// connection's traffic keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatelessResetToken([u8; 16]);

impl fmt::Debug for StatelessResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatelessResetToken(..)")
    }
}

impl StatelessResetToken {
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_oversized_ids() {
        let bytes = [0u8; MAX_LEN + 1];
        assert!(LocalId::try_from_bytes(&bytes).is_none());
    }

    #[test]
    fn local_id_permits_zero_length() {
        assert!(LocalId::try_from_bytes(&[]).is_some());
        assert!(PeerId::try_from_bytes(&[]).is_none());
    }
}
