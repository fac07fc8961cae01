pub mod request;
pub mod response;

use thiserror::Error;

pub use request::{parse_request, CreateChild, CreateRequest, Request, TransactionsRequest, TxnChild};
pub use response::{render_results, FillRecord, OpenOrCanceled, ResponseChild};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("xml decode error: {0}")]
    Xml(#[from] quick_xml::de::DeError),
    #[error("malformed xml: {0}")]
    Malformed(String),
    #[error("unknown root element: {0}")]
    UnknownRoot(String),
}
