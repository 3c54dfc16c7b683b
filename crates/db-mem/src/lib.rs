pub mod inmemory_dao;
