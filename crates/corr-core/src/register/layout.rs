//! Static bit layouts for packed 32-bit hardware registers.
//!
//! A [`RegisterLayout`] is a table of named fields, each described by a
//! [`FieldSpec`] (bit offset, bit width and interpretation).  Layouts are
//! plain `static` data: they own no hardware state and are only used to turn
//! a raw word into named values and back.
//!
//! Every layout must cover all 32 bits exactly once.  Unused bits are given a
//! `reserved` field so that a read-modify-write carries them through
//! untouched.  [`RegisterLayout::is_well_formed`] is a `const fn`, which lets
//! the register catalogue reject a malformed table at compile time:
//!
//! ```rust
//! use corr_core::register::{FieldSpec, RegisterLayout};
//!
//! static CTRL: RegisterLayout = RegisterLayout::new(
//!     "ctrl",
//!     &[
//!         FieldSpec::flag("reset", 0),
//!         FieldSpec::unsigned("reserved", 1, 31),
//!     ],
//! );
//! const _: () = assert!(CTRL.is_well_formed());
//! ```

use thiserror::Error;

/// Number of bits in every hardware register word.
pub const REGISTER_BITS: u32 = 32;

/// Errors raised by layout validation and by field access on a snapshot.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// The fields do not cover exactly 32 bits.
    #[error("layout {register}: fields cover mask 0x{covered:08X}, expected 0xFFFFFFFF")]
    Coverage { register: &'static str, covered: u32 },

    /// Two fields claim the same bit.
    #[error("layout {register}: field {field} overlaps an earlier field")]
    Overlap {
        register: &'static str,
        field: &'static str,
    },

    /// A field has zero width or extends past bit 31, or a flag is wider than one bit.
    #[error("layout {register}: field {field} has an invalid offset/width")]
    InvalidGeometry {
        register: &'static str,
        field: &'static str,
    },

    /// An enumerated field has more labels than its width can represent.
    #[error("layout {register}: field {field} has too many labels for its width")]
    TooManyLabels {
        register: &'static str,
        field: &'static str,
    },

    /// Two fields share a name.
    #[error("layout {register}: duplicate field name {field}")]
    DuplicateField {
        register: &'static str,
        field: &'static str,
    },

    /// A snapshot was asked for a field the layout does not define.
    #[error("register {register} has no field named {field:?}")]
    UnknownField {
        register: &'static str,
        field: String,
    },

    /// A value of the wrong interpretation was supplied for a field.
    #[error("field {field} of {register} is a {expected} field")]
    KindMismatch {
        register: &'static str,
        field: &'static str,
        expected: &'static str,
    },

    /// A numeric value does not fit in the field.
    #[error("value {value} does not fit in the {width}-bit field {field} of {register}")]
    ValueTooWide {
        register: &'static str,
        field: &'static str,
        value: u32,
        width: u8,
    },

    /// An enumeration label is not defined for the field.
    #[error("field {field} of {register} has no label {label:?}")]
    UnknownLabel {
        register: &'static str,
        field: &'static str,
        label: String,
    },

    /// A snapshot was encoded against a different layout than it was decoded with.
    #[error("snapshot of {snapshot} cannot be encoded with layout {layout}")]
    LayoutMismatch {
        snapshot: &'static str,
        layout: &'static str,
    },
}

// ── Field descriptions ────────────────────────────────────────────────────────

/// How the bits of a field are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// A single-bit boolean.
    Flag,
    /// An unsigned integer of the field's width.
    Unsigned,
    /// An unsigned integer whose values `0..labels.len()` have names.
    Enumerated(&'static [&'static str]),
}

impl FieldKind {
    pub const fn describe(&self) -> &'static str {
        match self {
            FieldKind::Flag => "flag",
            FieldKind::Unsigned => "unsigned",
            FieldKind::Enumerated(_) => "enumerated",
        }
    }
}

/// One named bit-range of a register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    /// Bit index of the least significant bit of the field.
    pub offset: u8,
    /// Number of bits, 1..=32.
    pub width: u8,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn flag(name: &'static str, offset: u8) -> Self {
        Self {
            name,
            offset,
            width: 1,
            kind: FieldKind::Flag,
        }
    }

    pub const fn unsigned(name: &'static str, offset: u8, width: u8) -> Self {
        Self {
            name,
            offset,
            width,
            kind: FieldKind::Unsigned,
        }
    }

    pub const fn enumerated(
        name: &'static str,
        offset: u8,
        width: u8,
        labels: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            offset,
            width,
            kind: FieldKind::Enumerated(labels),
        }
    }

    /// Right-aligned mask of the field's width.
    pub const fn value_mask(&self) -> u32 {
        if self.width >= 32 {
            u32::MAX
        } else {
            (1u32 << self.width) - 1
        }
    }

    /// Mask of the field's bits in place within the register word.
    pub const fn word_mask(&self) -> u32 {
        self.value_mask() << self.offset
    }

    /// Extracts the field's raw value from a register word.
    pub const fn extract(&self, word: u32) -> u32 {
        (word >> self.offset) & self.value_mask()
    }

    /// Returns `word` with this field replaced by `value` (already range-checked).
    pub const fn insert(&self, word: u32, value: u32) -> u32 {
        (word & !self.word_mask()) | ((value & self.value_mask()) << self.offset)
    }
}

// ── Layouts ───────────────────────────────────────────────────────────────────

/// The complete field table of one named register.
#[derive(Debug, PartialEq, Eq)]
pub struct RegisterLayout {
    /// Name of the register on the board.
    pub register: &'static str,
    pub fields: &'static [FieldSpec],
}

impl RegisterLayout {
    pub const fn new(register: &'static str, fields: &'static [FieldSpec]) -> Self {
        Self { register, fields }
    }

    /// `const` form of [`validate`](Self::validate), usable in static assertions.
    pub const fn is_well_formed(&self) -> bool {
        self.first_violation().is_none()
    }

    /// Checks geometry, overlap, label counts, unique names and full coverage.
    ///
    /// # Errors
    ///
    /// Returns the first [`LayoutError`] found, scanning fields in table order.
    pub fn validate(&self) -> Result<(), LayoutError> {
        let register = self.register;
        match self.first_violation() {
            None => Ok(()),
            Some(Violation::Geometry(field)) => {
                Err(LayoutError::InvalidGeometry { register, field })
            }
            Some(Violation::TooManyLabels(field)) => {
                Err(LayoutError::TooManyLabels { register, field })
            }
            Some(Violation::Overlap(field)) => Err(LayoutError::Overlap { register, field }),
            Some(Violation::Duplicate(field)) => {
                Err(LayoutError::DuplicateField { register, field })
            }
            Some(Violation::Coverage(covered)) => {
                Err(LayoutError::Coverage { register, covered })
            }
        }
    }

    const fn first_violation(&self) -> Option<Violation> {
        let mut covered: u64 = 0;
        let mut i = 0;
        while i < self.fields.len() {
            let field = &self.fields[i];
            let end = field.offset as u32 + field.width as u32;
            let flag_too_wide = matches!(field.kind, FieldKind::Flag) && field.width != 1;
            if field.width == 0 || end > REGISTER_BITS || flag_too_wide {
                return Some(Violation::Geometry(field.name));
            }
            if let FieldKind::Enumerated(labels) = field.kind {
                if labels.len() as u64 > (field.value_mask() as u64) + 1 {
                    return Some(Violation::TooManyLabels(field.name));
                }
            }
            let mask = field.word_mask() as u64;
            if covered & mask != 0 {
                return Some(Violation::Overlap(field.name));
            }
            covered |= mask;

            let mut j = 0;
            while j < i {
                if str_eq(self.fields[j].name, field.name) {
                    return Some(Violation::Duplicate(field.name));
                }
                j += 1;
            }
            i += 1;
        }
        if covered != u32::MAX as u64 {
            return Some(Violation::Coverage(covered as u32));
        }
        None
    }

    /// Looks up a field by name, returning its index in the table.
    pub fn field(&self, name: &str) -> Option<(usize, &'static FieldSpec)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name)
    }

    pub(crate) fn require_field(
        &self,
        name: &str,
    ) -> Result<(usize, &'static FieldSpec), LayoutError> {
        self.field(name).ok_or_else(|| LayoutError::UnknownField {
            register: self.register,
            field: name.to_string(),
        })
    }
}

/// Copyable form of the validation errors, so the check can run in `const`.
#[derive(Debug, Clone, Copy)]
enum Violation {
    Geometry(&'static str),
    TooManyLabels(&'static str),
    Overlap(&'static str),
    Duplicate(&'static str),
    Coverage(u32),
}

const fn str_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        if a[i] != b[i] {
            return false;
        }
        i += 1;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    static GOOD: RegisterLayout = RegisterLayout::new(
        "good",
        &[
            FieldSpec::flag("enable", 0),
            FieldSpec::enumerated("mode", 1, 2, &["a", "b", "c"]),
            FieldSpec::unsigned("count", 3, 29),
        ],
    );
    const _: () = assert!(GOOD.is_well_formed());

    #[test]
    fn test_well_formed_layout_validates() {
        assert_eq!(GOOD.validate(), Ok(()));
    }

    #[test]
    fn test_gap_is_a_coverage_error() {
        static GAP: RegisterLayout =
            RegisterLayout::new("gap", &[FieldSpec::unsigned("low", 0, 16)]);
        assert_eq!(
            GAP.validate(),
            Err(LayoutError::Coverage {
                register: "gap",
                covered: 0x0000_FFFF
            })
        );
    }

    #[test]
    fn test_overlapping_fields_are_rejected() {
        static OVERLAP: RegisterLayout = RegisterLayout::new(
            "overlap",
            &[
                FieldSpec::unsigned("a", 0, 20),
                FieldSpec::unsigned("b", 16, 16),
            ],
        );
        assert_eq!(
            OVERLAP.validate(),
            Err(LayoutError::Overlap {
                register: "overlap",
                field: "b"
            })
        );
    }

    #[test]
    fn test_field_past_bit_31_is_rejected() {
        static WIDE: RegisterLayout =
            RegisterLayout::new("wide", &[FieldSpec::unsigned("a", 4, 30)]);
        assert!(matches!(
            WIDE.validate(),
            Err(LayoutError::InvalidGeometry { field: "a", .. })
        ));
    }

    #[test]
    fn test_multi_bit_flag_is_rejected() {
        static FLAG: RegisterLayout = RegisterLayout::new(
            "flag",
            &[FieldSpec {
                name: "f",
                offset: 0,
                width: 32,
                kind: FieldKind::Flag,
            }],
        );
        assert!(!FLAG.is_well_formed());
    }

    #[test]
    fn test_too_many_labels_for_width() {
        static LABELS: RegisterLayout = RegisterLayout::new(
            "labels",
            &[
                FieldSpec::enumerated("m", 0, 1, &["x", "y", "z"]),
                FieldSpec::unsigned("rest", 1, 31),
            ],
        );
        assert!(matches!(
            LABELS.validate(),
            Err(LayoutError::TooManyLabels { .. })
        ));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        static DUP: RegisterLayout = RegisterLayout::new(
            "dup",
            &[
                FieldSpec::unsigned("x", 0, 16),
                FieldSpec::unsigned("x", 16, 16),
            ],
        );
        assert!(matches!(
            DUP.validate(),
            Err(LayoutError::DuplicateField { field: "x", .. })
        ));
    }

    #[test]
    fn test_full_width_field_masks() {
        let word = FieldSpec::unsigned("word", 0, 32);
        assert_eq!(word.value_mask(), u32::MAX);
        assert_eq!(word.extract(0xDEAD_BEEF), 0xDEAD_BEEF);
        assert_eq!(word.insert(0, 0x1234_5678), 0x1234_5678);
    }

    #[test]
    fn test_insert_preserves_other_bits() {
        let field = FieldSpec::unsigned("mid", 8, 8);
        assert_eq!(field.insert(0xFFFF_FFFF, 0x12), 0xFFFF_12FF);
        assert_eq!(field.extract(0xFFFF_12FF), 0x12);
    }
}
