//! Layout of the flat recurrent state buffer.
//!
//! Layer `i` owns five consecutive vectors of `n_embed` floats starting at
//! `i * 5 * n_embed`, in the order of [`StateField`]. The layout is part of the
//! public contract: buffers may be saved and moved between contexts of one model.

/// Initial value of the log-scale maximum; the other four fields start at zero.
pub const PP_INIT: f32 = -1e30;

/// Number of state vectors per layer.
pub const FIELDS_PER_LAYER: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateField {
    /// Channel-mixing carry: previous normalized input of the ffn block.
    FfnXx,
    /// Time-mixing carry: previous normalized input of the attention block.
    AttXx,
    /// Running WKV numerator.
    AttAa,
    /// Running WKV denominator.
    AttBb,
    /// Running log-scale maximum.
    AttPp,
}

impl StateField {
    pub const ALL: [StateField; FIELDS_PER_LAYER] =
        [Self::FfnXx, Self::AttXx, Self::AttAa, Self::AttBb, Self::AttPp];

    pub fn initial_value(self) -> f32 {
        match self {
            Self::AttPp => PP_INIT,
            _ => 0.0,
        }
    }
}

/// Position of one field inside the flat buffer, in floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSlot {
    pub offset: usize,
    pub len: usize,
}

impl StateSlot {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// One value per state field of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerState<T> {
    pub ffn_xx: T,
    pub att_xx: T,
    pub att_aa: T,
    pub att_bb: T,
    pub att_pp: T,
}

impl<T: Copy> LayerState<T> {
    pub fn get(&self, field: StateField) -> T {
        match field {
            StateField::FfnXx => self.ffn_xx,
            StateField::AttXx => self.att_xx,
            StateField::AttAa => self.att_aa,
            StateField::AttBb => self.att_bb,
            StateField::AttPp => self.att_pp,
        }
    }

    pub fn from_fn(mut f: impl FnMut(StateField) -> T) -> Self {
        Self {
            ffn_xx: f(StateField::FfnXx),
            att_xx: f(StateField::AttXx),
            att_aa: f(StateField::AttAa),
            att_bb: f(StateField::AttBb),
            att_pp: f(StateField::AttPp),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateLayout {
    pub n_embed: usize,
    pub n_layer: usize,
}

impl StateLayout {
    pub fn new(n_embed: usize, n_layer: usize) -> Self {
        Self { n_embed, n_layer }
    }

    /// Required buffer length in floats.
    pub fn len(&self) -> usize {
        FIELDS_PER_LAYER * self.n_embed * self.n_layer
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slot(&self, layer: usize, field: StateField) -> StateSlot {
        debug_assert!(layer < self.n_layer);
        StateSlot { offset: (layer * FIELDS_PER_LAYER + field as usize) * self.n_embed, len: self.n_embed }
    }

    pub fn layer_slots(&self, layer: usize) -> LayerState<StateSlot> {
        LayerState::from_fn(|field| self.slot(layer, field))
    }

    /// Writes the initial state into `state`, which must be exactly [`Self::len`] long.
    pub fn init(&self, state: &mut [f32]) {
        debug_assert_eq!(state.len(), self.len());
        for layer in 0..self.n_layer {
            for field in StateField::ALL {
                state[self.slot(layer, field).range()].fill(field.initial_value());
            }
        }
    }
}
