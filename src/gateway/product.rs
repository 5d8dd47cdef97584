use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::fmt;

use crate::models::{
    OpenOrder, OpenOrders, Order, OrderClass, OrderKind, Side, TimeInForce, TriggerPrice,
};

/// Venue product family traded by this instance
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Product {
    Spot,
    /// USDT-margined perpetual
    #[default]
    Linear,
    /// Coin-margined contract, quantity counted in quote currency
    Inverse,
    UsdcPerp,
}

impl Product {
    /// Rules adapter for this product
    pub fn rules(&self) -> &'static dyn ProductRules {
        match self {
            Product::Spot => &SpotRules,
            Product::Linear => &LinearRules,
            Product::Inverse => &InverseRules,
            Product::UsdcPerp => &UsdcPerpRules,
        }
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Product::Spot => "spot",
            Product::Linear => "linear",
            Product::Inverse => "inverse",
            Product::UsdcPerp => "usdc_perp",
        };
        write!(f, "{}", s)
    }
}

/// Per-product differences a gateway adapter has to respect
pub trait ProductRules: Send + Sync {
    fn supports_conditional(&self) -> bool {
        true
    }

    fn supports_amend(&self) -> bool {
        true
    }

    /// Whether conditional orders show up in the active order listing
    fn conditional_listed_as_active(&self) -> bool {
        false
    }

    /// Whether position size is denominated in quote currency
    fn qty_in_quote(&self) -> bool {
        false
    }

    /// Venue request body for placing `order` on `symbol`
    fn order_params(&self, symbol: &str, order: &Order) -> Value;
}

/// Split a venue listing into active and conditional orders
///
/// Products that list stop orders among active ones are re-split by order class.
pub fn normalize_listing(
    rules: &dyn ProductRules,
    active: Vec<OpenOrder>,
    conditional: Vec<OpenOrder>,
) -> OpenOrders {
    if !rules.conditional_listed_as_active() {
        return OpenOrders {
            active,
            conditional,
        };
    }
    let (listed_conditional, active): (Vec<_>, Vec<_>) = active
        .into_iter()
        .partition(|o| o.class == OrderClass::Conditional);
    OpenOrders {
        active,
        conditional: conditional.into_iter().chain(listed_conditional).collect(),
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "Buy",
        Side::Sell => "Sell",
    }
}

fn trigger_str(trigger: TriggerPrice) -> &'static str {
    match trigger {
        TriggerPrice::LastPrice => "LastPrice",
        TriggerPrice::MarkPrice => "MarkPrice",
        TriggerPrice::IndexPrice => "IndexPrice",
    }
}

fn derivative_tif(tif: TimeInForce) -> &'static str {
    match tif {
        TimeInForce::GoodTillCancel => "GoodTillCancel",
        TimeInForce::ImmediateOrCancel => "ImmediateOrCancel",
        TimeInForce::FillOrKill => "FillOrKill",
        TimeInForce::PostOnly => "PostOnly",
    }
}

fn insert_prices(params: &mut Map<String, Value>, order: &Order, price_key: &str, stop_key: &str) {
    if let Some(limit) = order.limit_price {
        params.insert(price_key.to_string(), json!(limit.to_string()));
    }
    if let Some(stop) = order.stop_price {
        params.insert(stop_key.to_string(), json!(stop.to_string()));
    }
}

pub struct SpotRules;

impl ProductRules for SpotRules {
    fn supports_conditional(&self) -> bool {
        false
    }

    fn supports_amend(&self) -> bool {
        false
    }

    fn order_params(&self, symbol: &str, order: &Order) -> Value {
        let order_type = match (order.kind, order.is_post_only()) {
            (OrderKind::Limit, true) => "LIMIT_MAKER",
            (OrderKind::Limit, false) => "LIMIT",
            _ => "MARKET",
        };
        let mut params = Map::new();
        params.insert("symbol".into(), json!(symbol));
        params.insert("side".into(), json!(side_str(order.side)));
        params.insert("orderType".into(), json!(order_type));
        params.insert("qty".into(), json!(order.requested_qty.to_string()));
        params.insert("orderLinkId".into(), json!(order.client_id));
        params.insert("timeInForce".into(), json!("GTC"));
        insert_prices(&mut params, order, "price", "triggerPrice");
        Value::Object(params)
    }
}

fn contract_params(symbol: &str, order: &Order) -> Map<String, Value> {
    let order_type = match order.kind {
        OrderKind::Limit | OrderKind::StopLimit => "Limit",
        OrderKind::Market | OrderKind::Stop => "Market",
    };
    let mut params = Map::new();
    params.insert("symbol".into(), json!(symbol));
    params.insert("side".into(), json!(side_str(order.side)));
    params.insert("order_type".into(), json!(order_type));
    params.insert("qty".into(), json!(order.requested_qty));
    params.insert("order_link_id".into(), json!(order.client_id));
    params.insert(
        "time_in_force".into(),
        json!(derivative_tif(order.time_in_force)),
    );
    params.insert("reduce_only".into(), json!(order.reduce_only));
    params.insert("position_idx".into(), json!(0));
    insert_prices(&mut params, order, "price", "stop_px");
    if order.kind.is_conditional() {
        params.insert("trigger_by".into(), json!(trigger_str(order.trigger_by)));
    }
    params
}

pub struct LinearRules;

impl ProductRules for LinearRules {
    fn order_params(&self, symbol: &str, order: &Order) -> Value {
        let mut params = contract_params(symbol, order);
        params.insert("close_on_trigger".into(), json!(false));
        Value::Object(params)
    }
}

pub struct InverseRules;

impl ProductRules for InverseRules {
    fn qty_in_quote(&self) -> bool {
        true
    }

    fn order_params(&self, symbol: &str, order: &Order) -> Value {
        Value::Object(contract_params(symbol, order))
    }
}

pub struct UsdcPerpRules;

impl ProductRules for UsdcPerpRules {
    fn conditional_listed_as_active(&self) -> bool {
        true
    }

    fn order_params(&self, symbol: &str, order: &Order) -> Value {
        let order_type = match order.kind {
            OrderKind::Limit | OrderKind::StopLimit => "Limit",
            OrderKind::Market | OrderKind::Stop => "Market",
        };
        let filter = if order.kind.is_conditional() {
            "StopOrder"
        } else {
            "Order"
        };
        let mut params = Map::new();
        params.insert("symbol".into(), json!(symbol));
        params.insert("side".into(), json!(side_str(order.side)));
        params.insert("orderType".into(), json!(order_type));
        params.insert("orderQty".into(), json!(order.requested_qty.to_string()));
        params.insert("orderLinkId".into(), json!(order.client_id));
        params.insert("orderFilter".into(), json!(filter));
        params.insert(
            "timeInForce".into(),
            json!(derivative_tif(order.time_in_force)),
        );
        params.insert("reduceOnly".into(), json!(order.reduce_only));
        insert_prices(&mut params, order, "orderPrice", "triggerPrice");
        if order.kind.is_conditional() {
            params.insert("triggerBy".into(), json!(trigger_str(order.trigger_by)));
        }
        Value::Object(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderStatus;
    use chrono::Utc;

    fn make_order(kind: OrderKind, tif: TimeInForce) -> Order {
        Order {
            client_id: "Long-1-a1b2c3".to_string(),
            side: Side::Buy,
            kind,
            requested_qty: 0.5,
            filled_qty: 0.0,
            limit_price: matches!(kind, OrderKind::Limit | OrderKind::StopLimit).then_some(100.0),
            stop_price: kind.is_conditional().then_some(95.0),
            reduce_only: false,
            time_in_force: tif,
            trigger_by: TriggerPrice::MarkPrice,
            status: OrderStatus::New,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_capabilities_per_product() {
        assert!(!Product::Spot.rules().supports_conditional());
        assert!(!Product::Spot.rules().supports_amend());
        assert!(Product::Linear.rules().supports_amend());
        assert!(Product::UsdcPerp.rules().conditional_listed_as_active());
        assert!(Product::Inverse.rules().qty_in_quote());
        assert!(!Product::Linear.rules().qty_in_quote());
    }

    #[test]
    fn test_spot_post_only_is_limit_maker() {
        let order = make_order(OrderKind::Limit, TimeInForce::PostOnly);
        let params = Product::Spot.rules().order_params("BTCUSDT", &order);
        assert_eq!(params["orderType"], "LIMIT_MAKER");
        assert_eq!(params["orderLinkId"], "Long-1-a1b2c3");
        assert_eq!(params["price"], "100");
    }

    #[test]
    fn test_linear_conditional_params() {
        let order = make_order(OrderKind::Stop, TimeInForce::GoodTillCancel);
        let params = Product::Linear.rules().order_params("BTCUSDT", &order);
        assert_eq!(params["order_type"], "Market");
        assert_eq!(params["stop_px"], "95");
        assert_eq!(params["trigger_by"], "MarkPrice");
        assert_eq!(params["order_link_id"], "Long-1-a1b2c3");
        assert!(params.get("price").is_none());
    }

    #[test]
    fn test_usdc_perp_uses_order_filter() {
        let order = make_order(OrderKind::StopLimit, TimeInForce::GoodTillCancel);
        let params = Product::UsdcPerp.rules().order_params("BTCPERP", &order);
        assert_eq!(params["orderFilter"], "StopOrder");
        assert_eq!(params["orderPrice"], "100");
        assert_eq!(params["triggerBy"], "MarkPrice");
    }

    #[test]
    fn test_product_deserializes_snake_case() {
        let product: Product = serde_json::from_str("\"usdc_perp\"").unwrap();
        assert_eq!(product, Product::UsdcPerp);
        assert_eq!(product.to_string(), "usdc_perp");
    }
}
