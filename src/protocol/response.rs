use std::convert::Infallible;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use rust_decimal::Decimal;

/// One execution leg as rendered in a `<status>`/`<canceled>` response.
#[derive(Debug, Clone)]
pub struct FillRecord {
    pub shares: Decimal,
    pub price: Decimal,
    pub time: i64,
}

/// The open-or-canceled state nested inside a `<status>` response. Absent entirely when
/// the order has fully executed (no remaining shares, never canceled).
#[derive(Debug, Clone)]
pub enum OpenOrCanceled {
    Open { shares: Decimal },
    Canceled { shares: Decimal, time: i64 },
}

/// One child of the `<results>` root, in the exact order it should appear in the
/// response — this enum exists precisely so the dispatcher can push children as it
/// processes requests and have them render back in that same order.
#[derive(Debug, Clone)]
pub enum ResponseChild {
    Created {
        id: Option<String>,
        sym: Option<String>,
    },
    Error {
        id: Option<String>,
        sym: Option<String>,
        amount: Option<Decimal>,
        limit: Option<Decimal>,
        message: String,
    },
    Opened {
        sym: String,
        amount: Decimal,
        limit: Decimal,
        id: String,
    },
    Status {
        id: String,
        state: Option<OpenOrCanceled>,
        fills: Vec<FillRecord>,
    },
    Canceled {
        id: String,
        shares: Decimal,
        time: i64,
        fills: Vec<FillRecord>,
    },
}

/// Renders an ordered batch of response children into a `<results>...</results>`
/// document. Written with a `quick_xml::Writer` directly, rather than `quick_xml::se`,
/// for full control over attribute vs. element placement and to render every numeric
/// value from `Decimal::to_string` rather than through a float conversion that would
/// lose precision.
pub fn render_results(children: &[ResponseChild]) -> String {
    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Start(BytesStart::new("results")))
        .expect("writing to an in-memory Vec never fails");
    for child in children {
        write_child(&mut writer, child);
    }
    writer
        .write_event(Event::End(BytesEnd::new("results")))
        .expect("writing to an in-memory Vec never fails");

    String::from_utf8(writer.into_inner()).expect("quick_xml only emits valid utf8")
}

fn write_child(writer: &mut Writer<Vec<u8>>, child: &ResponseChild) {
    match child {
        ResponseChild::Created { id, sym } => {
            let mut elem = writer.create_element("created");
            if let Some(id) = id {
                elem = elem.with_attribute(("id", id.as_str()));
            }
            if let Some(sym) = sym {
                elem = elem.with_attribute(("sym", sym.as_str()));
            }
            elem.write_empty().expect("writing to an in-memory Vec never fails");
        }
        ResponseChild::Error {
            id,
            sym,
            amount,
            limit,
            message,
        } => {
            let amount_s = amount.map(|a| a.to_string());
            let limit_s = limit.map(|l| l.to_string());
            let mut elem = writer.create_element("error");
            if let Some(id) = id {
                elem = elem.with_attribute(("id", id.as_str()));
            }
            if let Some(sym) = sym {
                elem = elem.with_attribute(("sym", sym.as_str()));
            }
            if let Some(a) = &amount_s {
                elem = elem.with_attribute(("amount", a.as_str()));
            }
            if let Some(l) = &limit_s {
                elem = elem.with_attribute(("limit", l.as_str()));
            }
            elem.write_text_content(BytesText::new(message))
                .expect("writing to an in-memory Vec never fails");
        }
        ResponseChild::Opened { sym, amount, limit, id } => {
            writer
                .create_element("opened")
                .with_attribute(("sym", sym.as_str()))
                .with_attribute(("amount", amount.to_string().as_str()))
                .with_attribute(("limit", limit.to_string().as_str()))
                .with_attribute(("id", id.as_str()))
                .write_empty()
                .expect("writing to an in-memory Vec never fails");
        }
        ResponseChild::Status { id, state, fills } => {
            writer
                .create_element("status")
                .with_attribute(("id", id.as_str()))
                .write_inner_content::<_, Infallible>(|w| {
                    if let Some(state) = state {
                        write_open_or_canceled(w, state);
                    }
                    for fill in fills {
                        write_fill(w, fill);
                    }
                    Ok(())
                })
                .expect("writing to an in-memory Vec never fails");
        }
        ResponseChild::Canceled { id, shares, time, fills } => {
            writer
                .create_element("canceled")
                .with_attribute(("id", id.as_str()))
                .with_attribute(("shares", shares.to_string().as_str()))
                .with_attribute(("time", time.to_string().as_str()))
                .write_inner_content::<_, Infallible>(|w| {
                    for fill in fills {
                        write_fill(w, fill);
                    }
                    Ok(())
                })
                .expect("writing to an in-memory Vec never fails");
        }
    }
}

fn write_open_or_canceled(writer: &mut Writer<Vec<u8>>, state: &OpenOrCanceled) {
    match state {
        OpenOrCanceled::Open { shares } => {
            writer
                .create_element("open")
                .with_attribute(("shares", shares.to_string().as_str()))
                .write_empty()
                .expect("writing to an in-memory Vec never fails");
        }
        OpenOrCanceled::Canceled { shares, time } => {
            writer
                .create_element("canceled")
                .with_attribute(("shares", shares.to_string().as_str()))
                .with_attribute(("time", time.to_string().as_str()))
                .write_empty()
                .expect("writing to an in-memory Vec never fails");
        }
    }
}

fn write_fill(writer: &mut Writer<Vec<u8>>, fill: &FillRecord) {
    writer
        .create_element("executed")
        .with_attribute(("shares", fill.shares.to_string().as_str()))
        .with_attribute(("price", fill.price.to_string().as_str()))
        .with_attribute(("time", fill.time.to_string().as_str()))
        .write_empty()
        .expect("writing to an in-memory Vec never fails");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn renders_children_in_push_order() {
        let children = vec![
            ResponseChild::Created {
                id: Some("A".into()),
                sym: None,
            },
            ResponseChild::Opened {
                sym: "SPY".into(),
                amount: dec!(100),
                limit: dec!(10),
                id: "1".into(),
            },
            ResponseChild::Error {
                id: Some("B".into()),
                sym: None,
                amount: None,
                limit: None,
                message: "account not found".into(),
            },
        ];
        let xml = render_results(&children);

        let created_pos = xml.find("<created").unwrap();
        let opened_pos = xml.find("<opened").unwrap();
        let error_pos = xml.find("<error").unwrap();
        assert!(created_pos < opened_pos);
        assert!(opened_pos < error_pos);
        assert!(xml.contains(r#"amount="100""#));
        assert!(xml.contains("account not found"));
    }

    #[test]
    fn status_with_fills_nests_executed_children() {
        let children = vec![ResponseChild::Status {
            id: "1".into(),
            state: Some(OpenOrCanceled::Open { shares: dec!(40) }),
            fills: vec![FillRecord {
                shares: dec!(60),
                price: dec!(9.5),
                time: 123,
            }],
        }];
        let xml = render_results(&children);
        assert!(xml.contains(r#"<open shares="40"/>"#));
        assert!(xml.contains(r#"price="9.5""#));
    }
}
