use std::sync::Arc;

use tracing::{instrument, warn};

use crate::matching::MatchEngine;
use crate::protocol::request::OrderRequest;
use crate::protocol::{
    CreateChild, CreateRequest, FillRecord, OpenOrCanceled, Request, ResponseChild, TransactionsRequest, TxnChild,
};
use crate::store::Store;

/// Turns a parsed request into an ordered list of response children (C7). Dispatches on
/// the exhaustive `CreateChild`/`TxnChild` enums rather than any runtime type
/// inspection — the original implementation's type switch is replaced by match
/// exhaustiveness the compiler checks for us (§9).
pub struct RequestDispatcher {
    engine: Arc<MatchEngine>,
    store: Arc<dyn Store>,
}

impl RequestDispatcher {
    pub fn new(engine: Arc<MatchEngine>, store: Arc<dyn Store>) -> Self {
        Self { engine, store }
    }

    #[instrument(skip(self, request))]
    pub async fn dispatch(&self, request: Request) -> Vec<ResponseChild> {
        match request {
            Request::Create(create) => self.handle_create(create).await,
            Request::Transactions(txn) => self.handle_transactions(txn).await,
        }
    }

    async fn handle_create(&self, request: CreateRequest) -> Vec<ResponseChild> {
        let mut out = Vec::with_capacity(request.children.len());
        for child in request.children {
            match child {
                CreateChild::Account(account) => {
                    out.push(self.process_create_account(account.id, account.balance).await);
                }
                CreateChild::Symbol(symbol) => {
                    self.engine.ensure_room(&symbol.sym).await;
                    for allocation in symbol.allocations {
                        out.push(
                            self.process_create_allocation(symbol.sym.clone(), allocation.id, allocation.amount)
                                .await,
                        );
                    }
                }
            }
        }
        out
    }

    async fn process_create_account(
        &self,
        id: String,
        balance: rust_decimal::Decimal,
    ) -> ResponseChild {
        match self.store.create_account(&id, balance).await {
            Ok(()) => {
                self.engine.seed_account_cache(&id, balance).await;
                ResponseChild::Created { id: Some(id), sym: None }
            }
            Err(e) => ResponseChild::Error {
                id: Some(id),
                sym: None,
                amount: None,
                limit: None,
                message: e.to_string(),
            },
        }
    }

    async fn process_create_allocation(
        &self,
        sym: String,
        account_id: String,
        amount: rust_decimal::Decimal,
    ) -> ResponseChild {
        match self.engine.allocate_position(&account_id, &sym, amount).await {
            Ok(_) => ResponseChild::Created {
                id: Some(account_id),
                sym: Some(sym),
            },
            Err(e) => ResponseChild::Error {
                id: Some(account_id),
                sym: Some(sym),
                amount: None,
                limit: None,
                message: e.to_string(),
            },
        }
    }

    async fn handle_transactions(&self, request: TransactionsRequest) -> Vec<ResponseChild> {
        let account_id = request.account_id;
        if !self.engine.account_known(&account_id).await {
            warn!(%account_id, "transactions request for unknown account");
            return request
                .children
                .iter()
                .map(|child| unknown_account_error(child))
                .collect();
        }

        let mut out = Vec::with_capacity(request.children.len());
        for child in request.children {
            let response = match child {
                TxnChild::Order(order) => self.process_order(&account_id, order).await,
                TxnChild::Query(query) => self.process_query(query.id).await,
                TxnChild::Cancel(cancel) => self.process_cancel(cancel.id).await,
            };
            out.push(response);
        }
        out
    }

    async fn process_order(&self, account_id: &str, order: OrderRequest) -> ResponseChild {
        let OrderRequest { sym, amount, limit } = order;

        if let Err(e) = self.engine.reserve(account_id, &sym, amount, limit).await {
            return ResponseChild::Error {
                id: None,
                sym: Some(sym),
                amount: Some(amount),
                limit: Some(limit),
                message: e.to_string(),
            };
        }

        match self.engine.place_order(account_id, &sym, amount, limit).await {
            Ok(order_id) => ResponseChild::Opened {
                sym,
                amount,
                limit,
                id: order_id,
            },
            Err(e) => ResponseChild::Error {
                id: None,
                sym: Some(sym),
                amount: Some(amount),
                limit: Some(limit),
                message: e.to_string(),
            },
        }
    }

    async fn process_query(&self, order_id: String) -> ResponseChild {
        match self.engine.get_order_status(&order_id).await {
            Ok((order, executions)) => status_response(order_id, &order, &executions),
            Err(e) => ResponseChild::Error {
                id: Some(order_id),
                sym: None,
                amount: None,
                limit: None,
                message: e.to_string(),
            },
        }
    }

    async fn process_cancel(&self, order_id: String) -> ResponseChild {
        if let Err(e) = self.engine.cancel_order(&order_id).await {
            return ResponseChild::Error {
                id: Some(order_id),
                sym: None,
                amount: None,
                limit: None,
                message: e.to_string(),
            };
        }

        match self.engine.get_order_status(&order_id).await {
            Ok((order, executions)) => ResponseChild::Canceled {
                id: order_id,
                shares: order.remaining,
                time: order.canceled_time.unwrap_or_default(),
                fills: executions.iter().map(fill_record).collect(),
            },
            Err(e) => ResponseChild::Error {
                id: Some(order_id),
                sym: None,
                amount: None,
                limit: None,
                message: e.to_string(),
            },
        }
    }
}

fn fill_record(execution: &crate::models::Execution) -> FillRecord {
    FillRecord {
        shares: execution.shares,
        price: execution.price,
        time: execution.timestamp,
    }
}

fn status_response(order_id: String, order: &crate::models::Order, executions: &[crate::models::Execution]) -> ResponseChild {
    use crate::models::OrderStatus;

    let state = match order.status {
        OrderStatus::Open => Some(OpenOrCanceled::Open { shares: order.remaining }),
        OrderStatus::Canceled => Some(OpenOrCanceled::Canceled {
            shares: order.remaining,
            time: order.canceled_time.unwrap_or_default(),
        }),
        OrderStatus::Executed => None,
    };

    ResponseChild::Status {
        id: order_id,
        state,
        fills: executions.iter().map(fill_record).collect(),
    }
}

fn unknown_account_error(child: &TxnChild) -> ResponseChild {
    match child {
        TxnChild::Order(order) => ResponseChild::Error {
            id: None,
            sym: Some(order.sym.clone()),
            amount: Some(order.amount),
            limit: Some(order.limit),
            message: "account not found".to_string(),
        },
        TxnChild::Query(query) => ResponseChild::Error {
            id: Some(query.id.clone()),
            sym: None,
            amount: None,
            limit: None,
            message: "account not found".to_string(),
        },
        TxnChild::Cancel(cancel) => ResponseChild::Error {
            id: Some(cancel.id.clone()),
            sym: None,
            amount: None,
            limit: None,
            message: "account not found".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_request;
    use crate::store::memory::InMemoryStore;
    use rust_decimal_macros::dec;

    async fn dispatcher() -> RequestDispatcher {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let engine = Arc::new(MatchEngine::new(store.clone(), 10, 50, 5).await.unwrap());
        RequestDispatcher::new(engine, store)
    }

    #[tokio::test]
    async fn create_account_then_order_round_trip() {
        let dispatcher = dispatcher().await;

        let create = match parse_request(r#"<create><account id="A" balance="1000"/></create>"#).unwrap() {
            Request::Create(c) => c,
            _ => unreachable!(),
        };
        let created = dispatcher.handle_create(create).await;
        assert!(matches!(created[0], ResponseChild::Created { .. }));

        let txn = match parse_request(
            r#"<transactions id="A"><order sym="SPY" amount="10" limit="5"/></transactions>"#,
        )
        .unwrap()
        {
            Request::Transactions(t) => t,
            _ => unreachable!(),
        };
        let responses = dispatcher.handle_transactions(txn).await;
        match &responses[0] {
            ResponseChild::Opened { sym, amount, limit, .. } => {
                assert_eq!(sym, "SPY");
                assert_eq!(*amount, dec!(10));
                assert_eq!(*limit, dec!(5));
            }
            other => panic!("expected Opened, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transactions_for_unknown_account_errors_every_child() {
        let dispatcher = dispatcher().await;
        let txn = match parse_request(
            r#"<transactions id="ghost"><query id="1"/><cancel id="2"/></transactions>"#,
        )
        .unwrap()
        {
            Request::Transactions(t) => t,
            _ => unreachable!(),
        };
        let responses = dispatcher.handle_transactions(txn).await;
        assert_eq!(responses.len(), 2);
        assert!(responses.iter().all(|r| matches!(r, ResponseChild::Error { .. })));
    }

    #[tokio::test]
    async fn query_on_open_order_reports_open_shares() {
        let dispatcher = dispatcher().await;
        dispatcher.store.create_account("A", dec!(1000)).await.unwrap();
        dispatcher.engine.seed_account_cache("A", dec!(1000)).await;
        dispatcher.engine.reserve("A", "SPY", dec!(10), dec!(5)).await.unwrap();
        let order_id = dispatcher.engine.place_order("A", "SPY", dec!(10), dec!(5)).await.unwrap();

        let response = dispatcher.process_query(order_id).await;
        match response {
            ResponseChild::Status { state: Some(OpenOrCanceled::Open { shares }), .. } => {
                assert_eq!(shares, dec!(10));
            }
            other => panic!("expected an open status, got {other:?}"),
        }
    }
}
