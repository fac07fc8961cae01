use quick_xml::events::Event;
use quick_xml::Reader;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::ProtocolError;

/// `<create>` root: an ordered list of `Account`/`Symbol` children. The enum tag on
/// `CreateChild` plus quick-xml's `$value` support is what makes this `Vec` decode in
/// input order rather than being grouped by element name.
#[derive(Debug, Deserialize)]
#[serde(rename = "create")]
pub struct CreateRequest {
    #[serde(rename = "$value", default)]
    pub children: Vec<CreateChild>,
}

#[derive(Debug, Deserialize)]
pub enum CreateChild {
    #[serde(rename = "account")]
    Account(AccountCreate),
    #[serde(rename = "symbol")]
    Symbol(SymbolCreate),
}

#[derive(Debug, Deserialize)]
pub struct AccountCreate {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@balance")]
    pub balance: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct SymbolCreate {
    #[serde(rename = "@sym")]
    pub sym: String,
    #[serde(rename = "account", default)]
    pub allocations: Vec<SymbolAllocation>,
}

#[derive(Debug, Deserialize)]
pub struct SymbolAllocation {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "$text")]
    pub amount: Decimal,
}

/// `<transactions id="...">` root: `order`/`query`/`cancel` children, again decoded in
/// input order via `TxnChild`.
#[derive(Debug, Deserialize)]
#[serde(rename = "transactions")]
pub struct TransactionsRequest {
    #[serde(rename = "@id")]
    pub account_id: String,
    #[serde(rename = "$value", default)]
    pub children: Vec<TxnChild>,
}

#[derive(Debug, Deserialize)]
pub enum TxnChild {
    #[serde(rename = "order")]
    Order(OrderRequest),
    #[serde(rename = "query")]
    Query(QueryRequest),
    #[serde(rename = "cancel")]
    Cancel(CancelRequest),
}

#[derive(Debug, Deserialize)]
pub struct OrderRequest {
    #[serde(rename = "@sym")]
    pub sym: String,
    #[serde(rename = "@amount")]
    pub amount: Decimal,
    #[serde(rename = "@limit")]
    pub limit: Decimal,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    #[serde(rename = "@id")]
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    #[serde(rename = "@id")]
    pub id: String,
}

#[derive(Debug)]
pub enum Request {
    Create(CreateRequest),
    Transactions(TransactionsRequest),
}

/// Peeks the root element's tag name the same way this codebase's original dispatcher
/// loop did (`decoder.Token()` scanning for the first `StartElement`), then deserializes
/// the whole document as the matching request kind.
pub fn parse_request(xml: &str) -> Result<Request, ProtocolError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                return match name.as_str() {
                    "create" => Ok(Request::Create(quick_xml::de::from_str(xml)?)),
                    "transactions" => Ok(Request::Transactions(quick_xml::de::from_str(xml)?)),
                    other => Err(ProtocolError::UnknownRoot(other.to_string())),
                };
            }
            Ok(Event::Eof) => return Err(ProtocolError::UnknownRoot(String::new())),
            Ok(_) => {
                buf.clear();
                continue;
            }
            Err(e) => return Err(ProtocolError::Malformed(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_create_request_preserving_child_order() {
        let xml = r#"<create>
            <account id="A" balance="1000"/>
            <symbol sym="SPY"><account id="A">50</account></symbol>
            <account id="B" balance="500"/>
        </create>"#;

        let Request::Create(create) = parse_request(xml).unwrap() else {
            panic!("expected a create request");
        };
        assert_eq!(create.children.len(), 3);
        assert!(matches!(create.children[0], CreateChild::Account(_)));
        assert!(matches!(create.children[2], CreateChild::Account(_)));
        match &create.children[1] {
            CreateChild::Symbol(symbol) => {
                assert_eq!(symbol.sym, "SPY");
                assert_eq!(symbol.allocations.len(), 1);
                assert_eq!(symbol.allocations[0].id, "A");
                assert_eq!(symbol.allocations[0].amount, dec!(50));
            }
            other => panic!("expected a symbol child, got {other:?}"),
        }
    }

    #[test]
    fn parses_transactions_request() {
        let xml = r#"<transactions id="A">
            <order sym="SPY" amount="100" limit="10"/>
            <query id="5"/>
            <cancel id="5"/>
        </transactions>"#;

        let Request::Transactions(txn) = parse_request(xml).unwrap() else {
            panic!("expected a transactions request");
        };
        assert_eq!(txn.account_id, "A");
        assert_eq!(txn.children.len(), 3);
        match &txn.children[0] {
            TxnChild::Order(o) => {
                assert_eq!(o.sym, "SPY");
                assert_eq!(o.amount, dec!(100));
                assert_eq!(o.limit, dec!(10));
            }
            other => panic!("expected an order child, got {other:?}"),
        }
    }

    #[test]
    fn unknown_root_element_is_rejected() {
        let xml = r#"<nonsense/>"#;
        assert!(matches!(parse_request(xml), Err(ProtocolError::UnknownRoot(_))));
    }
}
