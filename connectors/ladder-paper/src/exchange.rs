use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use ladder_broker::{BrokerError, BrokerInfo, BrokerResult, ExchangeClient};
use ladder_core::{round_cash, round_qty, Order, OrderId, OrderRequest, OrderStatus, Price, Symbol};
use rust_decimal::Decimal;
use tracing::debug;
use uuid::Uuid;

/// Scripted behavior for the next placed order.
#[derive(Clone, Debug)]
pub enum FillPlan {
    /// Fill in full inside the placement response.
    Immediate,
    /// Rest, then fill after this many status polls.
    AfterPolls(u32),
    /// Fill this fraction on the first poll and then rest forever.
    PartialThenHold { fraction: Decimal },
    /// Rest forever; only a cancel or timeout ends it.
    Never,
    /// Report the order as rejected by the venue.
    RejectNext(String),
}

struct RestingOrder {
    order: Order,
    plan: FillPlan,
    polls_seen: u32,
}

/// In-memory exchange with deterministic, scriptable fills.
///
/// Tests queue [`FillPlan`]s with [`PaperExchange::push_plan`]; an empty
/// queue means every order fills immediately at its limit price. Call
/// counters expose how often the engine actually reached the venue.
pub struct PaperExchange {
    fee_rate: Decimal,
    balance: Mutex<Price>,
    plans: Mutex<VecDeque<FillPlan>>,
    orders: Mutex<HashMap<OrderId, RestingOrder>>,
    place_calls: AtomicU32,
    status_calls: AtomicU32,
    cancel_calls: AtomicU32,
}

impl PaperExchange {
    #[must_use]
    pub fn new(balance: Price, fee_rate: Decimal) -> Self {
        Self {
            fee_rate,
            balance: Mutex::new(balance),
            plans: Mutex::new(VecDeque::new()),
            orders: Mutex::new(HashMap::new()),
            place_calls: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
            cancel_calls: AtomicU32::new(0),
        }
    }

    pub fn set_balance(&self, balance: Price) {
        *self.balance.lock().expect("paper balance poisoned") = balance;
    }

    /// Queue the behavior for the next placed order.
    pub fn push_plan(&self, plan: FillPlan) {
        self.plans
            .lock()
            .expect("paper plan queue poisoned")
            .push_back(plan);
    }

    pub fn place_calls(&self) -> u32 {
        self.place_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> u32 {
        self.cancel_calls.load(Ordering::SeqCst)
    }

    fn fee_for(&self, price: Price, quantity: Decimal) -> Price {
        round_cash(price * quantity * self.fee_rate)
    }

    fn fill(&self, order: &mut Order, fraction: Decimal) {
        let price = order.request.price;
        let quantity = round_qty(order.request.quantity * fraction);
        order.filled_quantity = quantity;
        order.avg_fill_price = Some(price);
        order.fee_paid = Some(self.fee_for(price, quantity));
        order.status = if fraction < Decimal::ONE {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Filled
        };
        order.updated_at = Utc::now();
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn info(&self) -> BrokerInfo {
        BrokerInfo {
            name: "paper".to_string(),
            markets: Vec::new(),
        }
    }

    async fn place_limit_order(&self, request: OrderRequest) -> BrokerResult<Order> {
        self.place_calls.fetch_add(1, Ordering::SeqCst);
        let plan = self
            .plans
            .lock()
            .expect("paper plan queue poisoned")
            .pop_front()
            .unwrap_or(FillPlan::Immediate);

        let now = Utc::now();
        let mut order = Order {
            id: Uuid::new_v4().to_string(),
            request,
            status: OrderStatus::Accepted,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            fee_paid: None,
            created_at: now,
            updated_at: now,
        };
        debug!(order_id = %order.id, plan = ?plan, "paper order placed");

        match plan {
            FillPlan::Immediate => {
                self.fill(&mut order, Decimal::ONE);
                Ok(order)
            }
            FillPlan::RejectNext(reason) => {
                debug!(order_id = %order.id, reason, "paper order rejected");
                order.status = OrderStatus::Rejected;
                Ok(order)
            }
            plan @ (FillPlan::AfterPolls(_) | FillPlan::PartialThenHold { .. } | FillPlan::Never) => {
                let resting = RestingOrder {
                    order: order.clone(),
                    plan,
                    polls_seen: 0,
                };
                self.orders
                    .lock()
                    .expect("paper order book poisoned")
                    .insert(order.id.clone(), resting);
                Ok(order)
            }
        }
    }

    async fn order_status(&self, order_id: &OrderId, _symbol: &Symbol) -> BrokerResult<Order> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let mut orders = self.orders.lock().expect("paper order book poisoned");
        let resting = orders
            .get_mut(order_id)
            .ok_or_else(|| BrokerError::InvalidRequest(format!("unknown order {order_id}")))?;
        resting.polls_seen += 1;
        match resting.plan {
            FillPlan::AfterPolls(n)
                if resting.polls_seen >= n && resting.order.status == OrderStatus::Accepted =>
            {
                let mut order = resting.order.clone();
                self.fill(&mut order, Decimal::ONE);
                resting.order = order.clone();
                Ok(order)
            }
            FillPlan::PartialThenHold { fraction }
                if resting.order.status == OrderStatus::Accepted =>
            {
                let mut order = resting.order.clone();
                self.fill(&mut order, fraction);
                resting.order = order.clone();
                Ok(order)
            }
            _ => Ok(resting.order.clone()),
        }
    }

    async fn cancel_order(&self, order_id: &OrderId, _symbol: &Symbol) -> BrokerResult<bool> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        let mut orders = self.orders.lock().expect("paper order book poisoned");
        match orders.get_mut(order_id) {
            Some(resting) => {
                resting.order.status = OrderStatus::Canceled;
                resting.order.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn available_balance(&self, _currency: &str) -> BrokerResult<Price> {
        Ok(*self.balance.lock().expect("paper balance poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ladder_core::Side;

    fn request(price: i64, quantity: i64) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            quantity: Decimal::from(quantity),
            price: Decimal::from(price),
            client_order_id: None,
        }
    }

    #[tokio::test]
    async fn immediate_plan_fills_at_the_limit() {
        let exchange = PaperExchange::new(Decimal::from(1000), Decimal::new(1, 3));
        let order = exchange.place_limit_order(request(100, 2)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_fill_price, Some(Decimal::from(100)));
        // 100 * 2 * 0.001
        assert_eq!(order.fee_paid, Some(Decimal::new(20, 2)));
        assert_eq!(exchange.place_calls(), 1);
    }

    #[tokio::test]
    async fn after_polls_plan_rests_then_fills() {
        let exchange = PaperExchange::new(Decimal::from(1000), Decimal::ZERO);
        exchange.push_plan(FillPlan::AfterPolls(2));
        let order = exchange.place_limit_order(request(100, 1)).await.unwrap();
        assert_eq!(order.status, OrderStatus::Accepted);

        let symbol = "BTCUSDT".to_string();
        let first = exchange.order_status(&order.id, &symbol).await.unwrap();
        assert_eq!(first.status, OrderStatus::Accepted);
        let second = exchange.order_status(&order.id, &symbol).await.unwrap();
        assert_eq!(second.status, OrderStatus::Filled);
        assert_eq!(exchange.status_calls(), 2);
    }

    #[tokio::test]
    async fn partial_plan_fills_a_fraction_once() {
        let exchange = PaperExchange::new(Decimal::from(1000), Decimal::ZERO);
        exchange.push_plan(FillPlan::PartialThenHold {
            fraction: Decimal::new(5, 1),
        });
        let order = exchange.place_limit_order(request(100, 10)).await.unwrap();
        let symbol = "BTCUSDT".to_string();
        let polled = exchange.order_status(&order.id, &symbol).await.unwrap();
        assert_eq!(polled.status, OrderStatus::PartiallyFilled);
        assert_eq!(polled.filled_quantity, Decimal::from(5));
        let again = exchange.order_status(&order.id, &symbol).await.unwrap();
        assert_eq!(again.filled_quantity, Decimal::from(5));
    }

    #[tokio::test]
    async fn cancel_marks_the_order_canceled() {
        let exchange = PaperExchange::new(Decimal::from(1000), Decimal::ZERO);
        exchange.push_plan(FillPlan::Never);
        let order = exchange.place_limit_order(request(100, 1)).await.unwrap();
        let symbol = "BTCUSDT".to_string();
        assert!(exchange.cancel_order(&order.id, &symbol).await.unwrap());
        let polled = exchange.order_status(&order.id, &symbol).await.unwrap();
        assert_eq!(polled.status, OrderStatus::Canceled);
    }
}
