//! Kernel error handling infrastructure.
//!
//! Provides the `define_kernel_error!` macro for consistent error type
//! definitions. Every subsystem error carries an 8-bit subsystem code and
//! an 8-bit variant code, combined into a stable `u16` for diagnostics.
//!
//! ## Usage
//!
//! ### Simple errors (no inner data)
//! ```ignore
//! define_kernel_error! {
//!     pub enum AllocError(0x01) {
//!         Exhausted = 0x01 => "out of physical pages",
//!     }
//! }
//! ```
//!
//! ### Nested errors (with inner error type)
//! ```ignore
//! define_kernel_error! {
//!     pub enum SetupError(0x03) {
//!         Alloc(AllocError) = 0x01 => "segment allocation failed",
//!         Map(MapError) = 0x02 => "segment mapping failed",
//!     }
//! }
//! ```

#![no_std]

/// Define a kernel error type with a subsystem code and per-variant codes.
///
/// Supports unit variants and variants wrapping one inner error type. The
/// generated enum gets `code()`, `name()`, `Display` and
/// `core::error::Error` impls.
#[macro_export]
macro_rules! define_kernel_error {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident($subsystem:literal) {
            $(
                $(#[$variant_meta:meta])*
                $variant:ident $(($inner:ty))? = $code:literal => $desc:literal
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis enum $name {
            $(
                $(#[$variant_meta])*
                $variant $(($inner))?,
            )*
        }

        impl $name {
            /// Subsystem identifier for this error type.
            pub const SUBSYSTEM: u8 = $subsystem;

            /// Numeric error code: subsystem in the high byte, variant in
            /// the low byte.
            pub const fn code(&self) -> u16 {
                match self {
                    $(
                        Self::$variant { .. } => (($subsystem as u16) << 8) | $code,
                    )*
                }
            }

            /// Short human-readable description for logging.
            pub const fn name(&self) -> &'static str {
                match self {
                    $(
                        Self::$variant { .. } => $desc,
                    )*
                }
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match self {
                    $(
                        $crate::define_kernel_error!(@pat $variant $(($inner))? inner) => {
                            $crate::define_kernel_error!(@fmt self f $desc $(($inner))? inner)
                        }
                    )*
                }
            }
        }

        impl core::error::Error for $name {}
    };

    // Match patterns: bind the inner error when the variant has one.
    (@pat $variant:ident ($inner:ty) $bind:ident) => { Self::$variant($bind) };
    (@pat $variant:ident $bind:ident) => { Self::$variant };

    // Display bodies: append the inner error when present.
    (@fmt $self:ident $f:ident $desc:literal ($inner:ty) $bind:ident) => {
        write!($f, "E{:04X}: {}: {}", $self.code(), $desc, $bind)
    };
    (@fmt $self:ident $f:ident $desc:literal $bind:ident) => {
        write!($f, "E{:04X}: {}", $self.code(), $desc)
    };
}
