use crate::constant::{ColumnFlags, ColumnType, CommandByte};

#[test]
fn column_type_bytes() {
    assert_eq!(ColumnType::MYSQL_TYPE_LONG as u8, 0x03);
    assert_eq!(ColumnType::MYSQL_TYPE_VAR_STRING as u8, 0xfd);
}

#[test]
fn statement_command_bytes() {
    assert_eq!(CommandByte::StmtSendLongData as u8, 0x18);
    assert_eq!(CommandByte::StmtFetch as u8, 0x1c);
    assert_eq!(CommandByte::StmtExecute.name(), "COM_STMT_EXECUTE");
}

#[test]
fn column_flags_from_bits() {
    let flags = ColumnFlags::from_bits_truncate(0x0021);
    assert!(flags.contains(ColumnFlags::NOT_NULL_FLAG));
    assert!(flags.contains(ColumnFlags::UNSIGNED_FLAG));
    assert!(!flags.contains(ColumnFlags::BLOB_FLAG));
}
