pub mod record_reader;
pub mod table_writer;
