// SPDX-License-Identifier: Apache-2.0

//! A tiny DSL for defining enum-based state machines with checked
//! transitions. Each `event!` arm generates a method that moves `self` from
//! one of a set of source states into a single target state, or returns
//! `InvalidTransition` without mutating state.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidTransition;

impl core::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "invalid state transition")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for InvalidTransition {}

/// Defines `is_*` predicate methods for one or more variants of a state enum.
macro_rules! is {
    ($name:ident, $($state:ident)|+) => {
        #[inline]
        pub fn $name(&self) -> bool {
            matches!(self, $(Self::$state)|+)
        }
    };
}

/// Defines checked transition methods on a state enum. Each event takes a
/// list of `Source => Target` or `SourceA | SourceB => Target` arms; calling
/// it while in a state not listed returns `Err(InvalidTransition)` and
/// leaves `self` untouched.
macro_rules! event {
    ($($name:ident($($($source:ident)|+ => $target:ident),+ $(,)?);)+) => {
        $(
            #[inline]
            pub fn $name(&mut self) -> Result<(), $crate::state::InvalidTransition> {
                match self {
                    $(
                        $(Self::$source)|+ => {
                            *self = Self::$target;
                            Ok(())
                        }
                    )+
                    #[allow(unreachable_patterns)]
                    _ => Err($crate::state::InvalidTransition),
                }
            }
        )+
    };
}

pub use event;
pub use is;

#[cfg(test)]
mod tests {
    #[derive(Clone, Debug, Default, PartialEq, Eq)]
    enum Light {
        #[default]
        Red,
        Yellow,
        Green,
    }

    impl Light {
        is!(is_red, Red);
        is!(is_stoppable, Red | Yellow);

        event! {
            on_advance(Red => Green, Green => Yellow, Yellow => Red);
        }
    }

    #[test]
    fn cycles_through_states() {
        let mut light = Light::Red;
        assert!(light.is_red());
        light.on_advance().unwrap();
        assert_eq!(light, Light::Green);
        light.on_advance().unwrap();
        assert_eq!(light, Light::Yellow);
        assert!(light.is_stoppable());
    }
}
