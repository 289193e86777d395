use crate::constant::{ColumnFlags, ColumnType};

/// Column or parameter definition sent by the server after `COM_STMT_PREPARE`
/// and in front of every binary result set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: ColumnType,
    pub flags: ColumnFlags,
    pub decimals: u8,
}

impl ColumnDefinition {
    /// A definition carrying only a name and a type, as the server reports for `?` placeholders
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            schema: String::new(),
            table: String::new(),
            name: name.into(),
            charset: 63,
            column_length: 0,
            column_type,
            flags: ColumnFlags::empty(),
            decimals: 0,
        }
    }
}
