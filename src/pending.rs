use anyhow::Result;
use log::info;

use crate::calendar::{TradeDate, TradingCalendar};
use crate::models::{PendingOrder, TradeSide};

/// Deferred orders retried at the start of every tick, in FIFO order.
/// An order leaves the queue on fill, on exceeding `max_retries`, or when
/// its trading-day age exceeds `max_retry_days`.
#[derive(Debug, Clone)]
pub struct PendingOrderQueue {
    orders: Vec<PendingOrder>,
    max_retries: u32,
    max_retry_days: u32,
}

impl PendingOrderQueue {
    pub fn new(max_retries: u32, max_retry_days: u32) -> Self {
        Self {
            orders: Vec::new(),
            max_retries,
            max_retry_days,
        }
    }

    pub fn from_orders(orders: Vec<PendingOrder>, max_retries: u32, max_retry_days: u32) -> Self {
        Self {
            orders,
            max_retries,
            max_retry_days,
        }
    }

    pub fn orders(&self) -> &[PendingOrder] {
        &self.orders
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn has(&self, ticker: &str, side: TradeSide) -> bool {
        self.orders
            .iter()
            .any(|order| order.ticker == ticker && order.side == side)
    }

    pub fn enqueue(&mut self, mut order: PendingOrder, date: TradeDate) {
        order.first_enqueued_date = date;
        order.retries_used = 0;
        info!(
            "pending {} {} enqueued on {} ({})",
            order.side.as_str(),
            order.ticker,
            date,
            order.reason
        );
        self.orders.push(order);
    }

    /// Drain the queue for this tick: expired orders are logged and dropped,
    /// the rest come back in FIFO order for the caller to attempt. Failed
    /// attempts re-enter via `requeue`.
    pub fn due_orders(
        &mut self,
        date: TradeDate,
        calendar: &TradingCalendar,
    ) -> Result<Vec<PendingOrder>> {
        let mut due = Vec::new();
        for order in self.orders.drain(..) {
            if order.retries_used > self.max_retries {
                info!(
                    "pending {} {} expired after {} retries (enqueued {}, reason {})",
                    order.side.as_str(),
                    order.ticker,
                    order.retries_used,
                    order.first_enqueued_date,
                    order.reason
                );
                continue;
            }
            let age = calendar.distance(order.first_enqueued_date, date)?;
            if age > self.max_retry_days as usize {
                info!(
                    "pending {} {} expired after {} trading days (enqueued {}, reason {})",
                    order.side.as_str(),
                    order.ticker,
                    age,
                    order.first_enqueued_date,
                    order.reason
                );
                continue;
            }
            due.push(order);
        }
        Ok(due)
    }

    /// Put a failed attempt back, bumping its retry counter.
    pub fn requeue(&mut self, mut order: PendingOrder) {
        order.retries_used += 1;
        self.orders.push(order);
    }
}
