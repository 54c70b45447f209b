//! Shared compilation settings.
//!
//! The back end consults only a handful of knobs; they are collected in an
//! immutable [`Flags`] value constructed through a [`Builder`] so that a
//! driver can thread one configuration through a whole compilation.

/// Flags group for the code generator.
#[derive(Clone, Debug)]
pub struct Flags {
    omit_frame_pointer: bool,
    gpr_limit: Option<u8>,
}

impl Flags {
    /// Create flags from a settings builder.
    pub fn new(builder: Builder) -> Self {
        Self {
            omit_frame_pointer: builder.omit_frame_pointer,
            gpr_limit: builder.gpr_limit,
        }
    }

    /// Is the frame pointer omitted?
    ///
    /// When false (the default), `%rbp` is established in the prologue and
    /// excluded from register allocation; spill slots and stack variables
    /// are addressed relative to it.
    pub fn omit_frame_pointer(&self) -> bool {
        self.omit_frame_pointer
    }

    /// Optional cap on the number of allocatable general-purpose registers.
    ///
    /// Shrinking the reservoir forces spills on small inputs, which is how
    /// the spiller tests exercise register pressure.
    pub fn gpr_limit(&self) -> Option<u8> {
        self.gpr_limit
    }
}

impl Default for Flags {
    fn default() -> Self {
        Self::new(builder())
    }
}

/// Collect settings prior to building a `Flags` value.
#[derive(Clone, Debug)]
pub struct Builder {
    omit_frame_pointer: bool,
    gpr_limit: Option<u8>,
}

/// Create a settings builder with everything at its default.
pub fn builder() -> Builder {
    Builder {
        omit_frame_pointer: false,
        gpr_limit: None,
    }
}

impl Builder {
    /// Omit the frame pointer, freeing `%rbp` for allocation.
    pub fn set_omit_frame_pointer(mut self, omit: bool) -> Self {
        self.omit_frame_pointer = omit;
        self
    }

    /// Limit the general-purpose reservoir to the first `n` allocatable units.
    pub fn set_gpr_limit(mut self, n: u8) -> Self {
        self.gpr_limit = Some(n);
        self
    }
}
