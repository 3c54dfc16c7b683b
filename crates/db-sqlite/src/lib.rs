pub mod sqlite_dao;
