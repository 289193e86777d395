use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{Error, Result};

/// Logical parameter identifier
///
/// `Index(n)` is the n-th placeholder that does not belong to any named group;
/// `Name(..)` covers every placeholder sharing that name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamId {
    Index(usize),
    Name(String),
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamId::Index(index) => write!(f, "{index}"),
            ParamId::Name(name) => write!(f, ":{name}"),
        }
    }
}

impl From<usize> for ParamId {
    fn from(index: usize) -> Self {
        ParamId::Index(index)
    }
}

impl From<&str> for ParamId {
    fn from(name: &str) -> Self {
        ParamId::Name(name.to_string())
    }
}

impl From<String> for ParamId {
    fn from(name: String) -> Self {
        ParamId::Name(name)
    }
}

/// A parameter value bound ahead of execution
///
/// Binding the same parameter again appends to the value, the way
/// `COM_STMT_SEND_LONG_DATA` streams a large value in several round trips.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundValue {
    data: Vec<u8>,
    chunks: usize,
}

impl BoundValue {
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: data.to_vec(),
            chunks: 1,
        }
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
        self.chunks += 1;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Number of bind calls accumulated into this value
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Value of one physical slot in an execute request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Argument {
    /// Supplied with the execute call
    Given(Vec<u8>),
    /// Already streamed to the server by an earlier bind
    Prebound(BoundValue),
}

impl Argument {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Argument::Given(data) => data,
            Argument::Prebound(value) => value.as_bytes(),
        }
    }

    pub fn is_prebound(&self) -> bool {
        matches!(self, Argument::Prebound(_))
    }
}

/// Logical meaning of one physical slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind<'a> {
    /// The n-th unnamed slot
    Unnamed(usize),
    Named(&'a str),
}

/// Maps logical parameter identifiers onto the physical placeholders of a statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamLayout {
    param_count: usize,
    groups: BTreeMap<String, Vec<usize>>,
    slot_names: BTreeMap<usize, String>,
    unnamed_slots: Vec<usize>,
}

impl ParamLayout {
    /// Layout of a statement with `param_count` placeholders and no named parameters
    pub fn positional(param_count: usize) -> Self {
        Self {
            param_count,
            groups: BTreeMap::new(),
            slot_names: BTreeMap::new(),
            unnamed_slots: (0..param_count).collect(),
        }
    }

    /// Build a layout from the named groups reported by prepare
    ///
    /// Every slot must be below `param_count` and claimed by at most one name.
    pub fn new<I, N, S>(param_count: usize, named: I) -> Result<Self>
    where
        I: IntoIterator<Item = (N, S)>,
        N: Into<String>,
        S: IntoIterator<Item = usize>,
    {
        let mut groups = BTreeMap::new();
        let mut slot_names = BTreeMap::new();

        for (name, slots) in named {
            let name = name.into();
            let slots: BTreeSet<usize> = slots.into_iter().collect();
            if slots.is_empty() {
                return Err(Error::BadConfigError(format!(
                    "named parameter :{name} has no placeholders"
                )));
            }
            for &slot in &slots {
                if slot >= param_count {
                    return Err(Error::BadConfigError(format!(
                        "named parameter :{name} refers to placeholder {slot}, but the statement has {param_count}"
                    )));
                }
                if let Some(other) = slot_names.insert(slot, name.clone()) {
                    return Err(Error::BadConfigError(format!(
                        "placeholder {slot} is claimed by both :{other} and :{name}"
                    )));
                }
            }
            if groups.insert(name.clone(), slots.into_iter().collect()).is_some() {
                return Err(Error::BadConfigError(format!(
                    "named parameter :{name} is defined twice"
                )));
            }
        }

        let unnamed_slots = (0..param_count)
            .filter(|slot| !slot_names.contains_key(slot))
            .collect();

        Ok(Self {
            param_count,
            groups,
            slot_names,
            unnamed_slots,
        })
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn unnamed_count(&self) -> usize {
        self.unnamed_slots.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Number of distinct values an execute needs: one per unnamed slot plus one per name
    pub fn logical_count(&self) -> usize {
        self.unnamed_count() + self.group_count()
    }

    pub fn group(&self, name: &str) -> Option<&[usize]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    pub fn slot_name(&self, slot: usize) -> Option<&str> {
        self.slot_names.get(&slot).map(String::as_str)
    }

    pub fn contains(&self, id: &ParamId) -> bool {
        match id {
            ParamId::Index(index) => *index < self.unnamed_count(),
            ParamId::Name(name) => self.groups.contains_key(name),
        }
    }

    /// Physical slots bound by `id`, in ascending order
    pub fn resolve(&self, id: &ParamId) -> Result<&[usize]> {
        match id {
            ParamId::Index(index) => self
                .unnamed_slots
                .get(*index..=*index)
                .ok_or_else(|| Error::UnknownParameter(id.clone())),
            ParamId::Name(name) => self
                .group(name)
                .ok_or_else(|| Error::UnknownParameter(id.clone())),
        }
    }

    /// Every physical slot in order, with its logical meaning
    pub fn slots(&self) -> impl Iterator<Item = (usize, SlotKind<'_>)> + '_ {
        let mut unnamed = 0;
        (0..self.param_count).map(move |slot| match self.slot_name(slot) {
            Some(name) => (slot, SlotKind::Named(name)),
            None => {
                unnamed += 1;
                (slot, SlotKind::Unnamed(unnamed - 1))
            }
        })
    }
}
