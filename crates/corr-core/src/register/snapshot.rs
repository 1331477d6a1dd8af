//! Decoded register values and the generic encode/decode pair.
//!
//! [`decode`] turns a raw word into a [`RegisterSnapshot`]; [`encode`] turns
//! it back.  Because every layout covers all 32 bits, a snapshot always
//! re-encodes the *entire* word: fields the caller did not touch keep the
//! value they were decoded with, they are never zeroed.

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::register::layout::{FieldKind, FieldSpec, LayoutError, RegisterLayout};

/// The decoded value of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Unsigned(u32),
    /// Raw value of an enumerated field.  It may lie outside the label table
    /// when the hardware reports a value the layout does not name.
    Enumerated(u32),
}

impl FieldValue {
    fn raw(self) -> u32 {
        match self {
            FieldValue::Flag(b) => u32::from(b),
            FieldValue::Unsigned(v) | FieldValue::Enumerated(v) => v,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Flag(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Unsigned(value)
    }
}

/// A named-field view of one register word.
///
/// Mutations are validated against the layout, so [`encode`](Self::encode)
/// cannot fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterSnapshot {
    layout: &'static RegisterLayout,
    values: Vec<FieldValue>,
}

/// Decodes `raw` against `layout`.
///
/// # Errors
///
/// Fails only when the layout itself is malformed (see
/// [`RegisterLayout::validate`]).
pub fn decode(layout: &'static RegisterLayout, raw: u32) -> Result<RegisterSnapshot, LayoutError> {
    layout.validate()?;
    let values = layout
        .fields
        .iter()
        .map(|field| {
            let bits = field.extract(raw);
            match field.kind {
                FieldKind::Flag => FieldValue::Flag(bits != 0),
                FieldKind::Unsigned => FieldValue::Unsigned(bits),
                FieldKind::Enumerated(_) => FieldValue::Enumerated(bits),
            }
        })
        .collect();
    Ok(RegisterSnapshot { layout, values })
}

/// Encodes `snapshot` with `layout`.
///
/// # Errors
///
/// Returns [`LayoutError::LayoutMismatch`] if the snapshot was decoded with a
/// different layout.
pub fn encode(layout: &'static RegisterLayout, snapshot: &RegisterSnapshot) -> Result<u32, LayoutError> {
    if !std::ptr::eq(layout, snapshot.layout) && layout != snapshot.layout {
        return Err(LayoutError::LayoutMismatch {
            snapshot: snapshot.layout.register,
            layout: layout.register,
        });
    }
    Ok(snapshot.encode())
}

impl RegisterSnapshot {
    pub fn layout(&self) -> &'static RegisterLayout {
        self.layout
    }

    /// Re-encodes every field into a register word.
    pub fn encode(&self) -> u32 {
        self.layout
            .fields
            .iter()
            .zip(&self.values)
            .fold(0u32, |word, (field, value)| field.insert(word, value.raw()))
    }

    /// Returns the value of `name`, if the layout defines it.
    pub fn get(&self, name: &str) -> Option<FieldValue> {
        self.layout.field(name).map(|(i, _)| self.values[i])
    }

    /// Reads a flag field.
    ///
    /// # Errors
    ///
    /// Unknown field, or the field is not a flag.
    pub fn flag(&self, name: &str) -> Result<bool, LayoutError> {
        let (i, field) = self.layout.require_field(name)?;
        match self.values[i] {
            FieldValue::Flag(b) => Ok(b),
            _ => Err(self.kind_mismatch(field)),
        }
    }

    /// Reads the numeric value of an unsigned or enumerated field.
    ///
    /// # Errors
    ///
    /// Unknown field, or the field is a flag.
    pub fn unsigned(&self, name: &str) -> Result<u32, LayoutError> {
        let (i, field) = self.layout.require_field(name)?;
        match self.values[i] {
            FieldValue::Unsigned(v) | FieldValue::Enumerated(v) => Ok(v),
            FieldValue::Flag(_) => Err(self.kind_mismatch(field)),
        }
    }

    /// Returns the label of an enumerated field, or `None` when the raw value
    /// has no label.
    ///
    /// # Errors
    ///
    /// Unknown field, or the field is not enumerated.
    pub fn label(&self, name: &str) -> Result<Option<&'static str>, LayoutError> {
        let (i, field) = self.layout.require_field(name)?;
        match (field.kind, self.values[i]) {
            (FieldKind::Enumerated(labels), FieldValue::Enumerated(v)) => {
                Ok(labels.get(v as usize).copied())
            }
            _ => Err(self.kind_mismatch(field)),
        }
    }

    /// Replaces the value of one field.
    ///
    /// # Errors
    ///
    /// Unknown field, wrong interpretation, or a value wider than the field.
    pub fn set(&mut self, name: &str, value: FieldValue) -> Result<(), LayoutError> {
        let (i, checked) = self.check(name, value)?;
        self.values[i] = checked;
        Ok(())
    }

    /// Sets an enumerated field by label.
    ///
    /// # Errors
    ///
    /// Unknown field, the field is not enumerated, or the label is undefined.
    pub fn set_label(&mut self, name: &str, label: &str) -> Result<(), LayoutError> {
        let (i, field) = self.layout.require_field(name)?;
        let FieldKind::Enumerated(labels) = field.kind else {
            return Err(self.kind_mismatch(field));
        };
        let index = labels
            .iter()
            .position(|l| *l == label)
            .ok_or_else(|| LayoutError::UnknownLabel {
                register: self.layout.register,
                field: field.name,
                label: label.to_string(),
            })?;
        self.values[i] = FieldValue::Enumerated(index as u32);
        Ok(())
    }

    /// Applies a set of field updates all-or-nothing: if any update is
    /// invalid the snapshot is left unchanged.
    ///
    /// # Errors
    ///
    /// The first invalid update, in the order given.
    pub fn apply(&mut self, updates: &[(&str, FieldValue)]) -> Result<(), LayoutError> {
        let checked = updates
            .iter()
            .map(|(name, value)| self.check(name, *value))
            .collect::<Result<Vec<_>, _>>()?;
        for (i, value) in checked {
            self.values[i] = value;
        }
        Ok(())
    }

    /// Iterates over `(field name, value)` in layout order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, FieldValue)> + '_ {
        self.layout
            .fields
            .iter()
            .map(|f| f.name)
            .zip(self.values.iter().copied())
    }

    fn check(&self, name: &str, value: FieldValue) -> Result<(usize, FieldValue), LayoutError> {
        let (i, field) = self.layout.require_field(name)?;
        let value = match (field.kind, value) {
            (FieldKind::Flag, FieldValue::Flag(_)) => value,
            (FieldKind::Unsigned, FieldValue::Unsigned(_)) => value,
            // Numeric updates to enumerated fields are accepted as raw values.
            (FieldKind::Enumerated(_), FieldValue::Enumerated(v) | FieldValue::Unsigned(v)) => {
                FieldValue::Enumerated(v)
            }
            _ => return Err(self.kind_mismatch(field)),
        };
        let raw = value.raw();
        if raw & !field.value_mask() != 0 {
            return Err(LayoutError::ValueTooWide {
                register: self.layout.register,
                field: field.name,
                value: raw,
                width: field.width,
            });
        }
        Ok((i, value))
    }

    fn kind_mismatch(&self, field: &FieldSpec) -> LayoutError {
        LayoutError::KindMismatch {
            register: self.layout.register,
            field: field.name,
            expected: field.kind.describe(),
        }
    }
}

impl Serialize for RegisterSnapshot {
    /// Serializes as a map of field name to value, labels in place of raw
    /// enumeration values where one exists.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (field, value) in self.layout.fields.iter().zip(&self.values) {
            match (field.kind, value) {
                (FieldKind::Enumerated(labels), FieldValue::Enumerated(v)) => {
                    match labels.get(*v as usize) {
                        Some(label) => map.serialize_entry(field.name, label)?,
                        None => map.serialize_entry(field.name, v)?,
                    }
                }
                _ => map.serialize_entry(field.name, value)?,
            }
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static CTRL: RegisterLayout = RegisterLayout::new(
        "ctrl",
        &[
            FieldSpec::flag("reset", 0),
            FieldSpec::flag("arm", 1),
            FieldSpec::enumerated("mode", 2, 2, &["idle", "run", "hold"]),
            FieldSpec::unsigned("count", 4, 12),
            FieldSpec::unsigned("reserved", 16, 16),
        ],
    );

    #[test]
    fn test_decode_splits_fields() {
        // Arrange – reset=1, arm=0, mode=run(1), count=0xABC, reserved=0xBEEF
        let raw = 0xBEEF_0000 | (0xABC << 4) | (1 << 2) | 1;

        // Act
        let snap = decode(&CTRL, raw).unwrap();

        // Assert
        assert!(snap.flag("reset").unwrap());
        assert!(!snap.flag("arm").unwrap());
        assert_eq!(snap.label("mode").unwrap(), Some("run"));
        assert_eq!(snap.unsigned("count").unwrap(), 0xABC);
        assert_eq!(snap.unsigned("reserved").unwrap(), 0xBEEF);
        assert_eq!(snap.encode(), raw);
    }

    #[test]
    fn test_unlabelled_enumeration_value_survives_round_trip() {
        let raw = 3 << 2;
        let snap = decode(&CTRL, raw).unwrap();
        assert_eq!(snap.label("mode").unwrap(), None);
        assert_eq!(snap.unsigned("mode").unwrap(), 3);
        assert_eq!(encode(&CTRL, &snap).unwrap(), raw);
    }

    #[test]
    fn test_set_keeps_untouched_fields() {
        let mut snap = decode(&CTRL, 0xFFFF_FFF0).unwrap();

        snap.set("arm", true.into()).unwrap();

        assert_eq!(snap.encode(), 0xFFFF_FFF2);
    }

    #[test]
    fn test_set_label_writes_index() {
        let mut snap = decode(&CTRL, 0).unwrap();
        snap.set_label("mode", "hold").unwrap();
        assert_eq!(snap.encode(), 2 << 2);
    }

    #[test]
    fn test_set_rejects_value_wider_than_field() {
        let mut snap = decode(&CTRL, 0).unwrap();
        let err = snap.set("count", FieldValue::Unsigned(0x1000)).unwrap_err();
        assert!(matches!(err, LayoutError::ValueTooWide { width: 12, .. }));
    }

    #[test]
    fn test_set_rejects_kind_mismatch() {
        let mut snap = decode(&CTRL, 0).unwrap();
        let err = snap.set("reset", FieldValue::Unsigned(1)).unwrap_err();
        assert!(matches!(err, LayoutError::KindMismatch { expected: "flag", .. }));
    }

    #[test]
    fn test_unknown_field_and_label() {
        let mut snap = decode(&CTRL, 0).unwrap();
        assert!(matches!(
            snap.flag("nope"),
            Err(LayoutError::UnknownField { .. })
        ));
        assert!(matches!(
            snap.set_label("mode", "sprint"),
            Err(LayoutError::UnknownLabel { .. })
        ));
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let mut snap = decode(&CTRL, 0x0000_0010).unwrap();
        let before = snap.clone();

        let result = snap.apply(&[
            ("reset", true.into()),
            ("count", FieldValue::Unsigned(0xFFFF)),
        ]);

        assert!(result.is_err());
        assert_eq!(snap, before, "a rejected batch must not change the snapshot");
    }

    #[test]
    fn test_encode_with_other_layout_is_rejected() {
        static OTHER: RegisterLayout =
            RegisterLayout::new("other", &[FieldSpec::unsigned("word", 0, 32)]);
        let snap = decode(&CTRL, 0).unwrap();
        assert!(matches!(
            encode(&OTHER, &snap),
            Err(LayoutError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn test_decode_fails_for_malformed_layout() {
        static SHORT: RegisterLayout =
            RegisterLayout::new("short", &[FieldSpec::unsigned("low", 0, 8)]);
        assert!(matches!(
            decode(&SHORT, 0),
            Err(LayoutError::Coverage { .. })
        ));
    }

    #[test]
    fn test_iter_yields_layout_order() {
        let snap = decode(&CTRL, 0).unwrap();
        let names: Vec<_> = snap.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["reset", "arm", "mode", "count", "reserved"]);
    }
}
