//! Typed protocol messages and the framed stream they travel on.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod socket;
pub mod types;

pub use constants::*;
pub use error::PgErrorMsg;
pub use protocol::{
    auth_ok, backend_key_data, cancel_request, command_complete, data_row, empty_query_response,
    error_message, error_message_severity, error_response, error_response_terminal, flush_message,
    frame, md5_challenge, md5_hash_password, md5_hash_second_pass, parse_complete,
    parse_startup_params, plain_password_challenge, read_password, ready_for_query,
    row_description, scram_server_response, scram_start_challenge, server_parameter_message,
    simple_query, startup_message, sync_message, wrong_password,
};
pub use socket::{read_message, write_all, write_all_flush, WireStream};
pub use types::{vec_to_string, BytesMutReader, DataType};
