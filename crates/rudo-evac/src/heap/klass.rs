//! Type metadata for heap objects.
//!
//! Layouts, in words:
//!
//! - instance: `[header, ref_0 .. ref_n, data_0 .. data_m]`
//! - object array: `[header, length, elem_0 .. elem_len]`
//! - type array: `[header, length, data_0 .. data_len]`

use super::header::KlassId;

/// Klass id of the built-in single-word filler.
pub const FILLER_WORD_KLASS: KlassId = 0;
/// Klass id of the built-in filler array used for gaps of two or more words.
pub const FILLER_ARRAY_KLASS: KlassId = 1;

/// Words occupied by an array header (mark word plus length).
pub const ARRAY_HEADER_WORDS: usize = 2;

/// The shape of objects of one klass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KlassKind {
    /// Fixed layout with `ref_fields` references followed by `data_words` raw words.
    Instance {
        /// Number of reference fields.
        ref_fields: u32,
        /// Number of non-reference words after the references.
        data_words: u32,
    },
    /// Array of references.
    ObjArray,
    /// Array of raw words.
    TypeArray,
}

/// A registered object type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Klass {
    name: String,
    kind: KlassKind,
}

impl Klass {
    /// A fixed-layout klass.
    #[must_use]
    pub fn instance(name: impl Into<String>, ref_fields: u32, data_words: u32) -> Self {
        Self {
            name: name.into(),
            kind: KlassKind::Instance {
                ref_fields,
                data_words,
            },
        }
    }

    /// An array-of-references klass.
    #[must_use]
    pub fn obj_array(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: KlassKind::ObjArray,
        }
    }

    /// An array-of-words klass.
    #[must_use]
    pub fn type_array(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: KlassKind::TypeArray,
        }
    }

    /// Human readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Layout of the klass.
    #[must_use]
    pub const fn kind(&self) -> KlassKind {
        self.kind
    }

    /// Whether instances are arrays of either flavour.
    #[must_use]
    pub const fn is_array(&self) -> bool {
        matches!(self.kind, KlassKind::ObjArray | KlassKind::TypeArray)
    }

    /// Whether instances are arrays of references.
    #[must_use]
    pub const fn is_obj_array(&self) -> bool {
        matches!(self.kind, KlassKind::ObjArray)
    }

    /// Instance size in words, or `None` for arrays whose size depends on the length.
    #[must_use]
    pub const fn fixed_size(&self) -> Option<usize> {
        match self.kind {
            KlassKind::Instance {
                ref_fields,
                data_words,
            } => Some(1 + ref_fields as usize + data_words as usize),
            KlassKind::ObjArray | KlassKind::TypeArray => None,
        }
    }

    /// Number of reference slots in an object of this klass with the given array length.
    #[must_use]
    pub const fn ref_count(&self, array_length: usize) -> usize {
        match self.kind {
            KlassKind::Instance { ref_fields, .. } => ref_fields as usize,
            KlassKind::ObjArray => array_length,
            KlassKind::TypeArray => 0,
        }
    }

    /// Word offset of the first reference slot.
    #[must_use]
    pub const fn first_ref_offset(&self) -> usize {
        match self.kind {
            KlassKind::Instance { .. } => 1,
            KlassKind::ObjArray | KlassKind::TypeArray => ARRAY_HEADER_WORDS,
        }
    }
}

/// Array size in words for `length` elements.
#[must_use]
pub const fn array_size(length: usize) -> usize {
    ARRAY_HEADER_WORDS + length
}

/// The table every header's klass id indexes into.
#[derive(Debug)]
pub struct KlassTable {
    klasses: Vec<Klass>,
    capacity: usize,
}

impl KlassTable {
    /// A table holding only the filler klasses.
    pub(crate) fn new(capacity: usize) -> Self {
        let mut klasses = Vec::with_capacity(capacity);
        klasses.push(Klass::instance("filler-word", 0, 0));
        klasses.push(Klass::type_array("filler-array"));
        Self { klasses, capacity }
    }

    /// Add a klass, returning its id, or `None` when full.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn register(&mut self, klass: Klass) -> Option<KlassId> {
        if self.klasses.len() >= self.capacity {
            return None;
        }
        self.klasses.push(klass);
        Some((self.klasses.len() - 1) as KlassId)
    }

    /// Look up a klass.
    ///
    /// # Panics
    ///
    /// Panics on an id that was never registered.
    #[must_use]
    pub fn get(&self, id: KlassId) -> &Klass {
        &self.klasses[id as usize]
    }

    /// Number of registered klasses, fillers included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.klasses.len()
    }

    /// Never true: the fillers are always present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.klasses.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fillers_are_builtin() {
        let table = KlassTable::new(4);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(FILLER_WORD_KLASS).fixed_size(), Some(1));
        assert!(table.get(FILLER_ARRAY_KLASS).is_array());
        assert!(!table.get(FILLER_ARRAY_KLASS).is_obj_array());
    }

    #[test]
    fn test_register_until_full() {
        let mut table = KlassTable::new(3);
        assert_eq!(table.register(Klass::instance("node", 2, 1)), Some(2));
        assert_eq!(table.register(Klass::obj_array("refs")), None);
    }

    #[test]
    fn test_instance_layout() {
        let node = Klass::instance("node", 2, 3);
        assert_eq!(node.fixed_size(), Some(6));
        assert_eq!(node.ref_count(0), 2);
        assert_eq!(node.first_ref_offset(), 1);

        let refs = Klass::obj_array("refs");
        assert_eq!(refs.fixed_size(), None);
        assert_eq!(refs.ref_count(10), 10);
        assert_eq!(refs.first_ref_offset(), ARRAY_HEADER_WORDS);
        assert_eq!(array_size(10), 12);
    }
}
