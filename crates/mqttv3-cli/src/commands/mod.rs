pub mod broker_cmd;
pub mod passwd_cmd;
