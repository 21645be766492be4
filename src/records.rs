// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Row types stored under each [crate::EntityType], and the partial-update
//! ("patch") merge rule used when applying them.

use crate::{EntityType, Error};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Warehouse {
    pub w_id: i64,
    pub name: String,
    pub tax: f64,
    pub ytd: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct District {
    pub w_id: i64,
    pub d_id: i64,
    pub name: String,
    pub tax: f64,
    pub ytd: f64,
    pub next_o_id: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub w_id: i64,
    pub d_id: i64,
    pub c_id: i64,
    pub first: String,
    pub last: String,
    pub credit: String,
    pub discount: f64,
    pub balance: f64,
    pub ytd_payment: f64,
    pub payment_cnt: i64,
    pub delivery_cnt: i64,
    pub data: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub i_id: i64,
    pub im_id: i64,
    pub name: String,
    pub price: f64,
    pub data: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Stock {
    pub w_id: i64,
    pub i_id: i64,
    pub quantity: i64,
    pub ytd: i64,
    pub order_cnt: i64,
    pub remote_cnt: i64,
    pub data: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub c_id: i64,
    pub c_d_id: i64,
    pub c_w_id: i64,
    pub d_id: i64,
    pub w_id: i64,
    pub date: i64,
    pub amount: f64,
    pub data: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewOrder {
    pub w_id: i64,
    pub d_id: i64,
    pub o_id: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub w_id: i64,
    pub d_id: i64,
    pub o_id: i64,
    pub c_id: i64,
    pub entry_d: i64,
    pub carrier_id: i64,
    pub ol_cnt: i64,
    pub all_local: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub w_id: i64,
    pub d_id: i64,
    pub o_id: i64,
    pub number: i64,
    pub i_id: i64,
    pub supply_w_id: i64,
    pub delivery_d: i64,
    pub quantity: i64,
    pub amount: f64,
    pub dist_info: String,
}

/// A stored value. Each variant belongs to the [EntityType] of the same name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Text(String),
    Warehouse(Warehouse),
    District(District),
    Customer(Customer),
    Item(Item),
    Stock(Stock),
    History(History),
    NewOrder(NewOrder),
    Order(Order),
    OrderLine(OrderLine),
}

// Copies `src` over `dst` unless `src` holds its type's default, which a
// partial update uses to mean "leave this field alone".
fn merge<T: PartialEq + Default + Clone>(dst: &mut T, src: &T) {
    if *src != T::default() {
        *dst = src.clone();
    }
}

impl Value {
    pub fn entity(&self) -> EntityType {
        match self {
            Value::Text(_) => EntityType::Kv,
            Value::Warehouse(_) => EntityType::Warehouse,
            Value::District(_) => EntityType::District,
            Value::Customer(_) => EntityType::Customer,
            Value::Item(_) => EntityType::Item,
            Value::Stock(_) => EntityType::Stock,
            Value::History(_) => EntityType::History,
            Value::NewOrder(_) => EntityType::NewOrder,
            Value::Order(_) => EntityType::Order,
            Value::OrderLine(_) => EntityType::OrderLine,
        }
    }

    /// Merges the non-default fields of `patch` into `self`.
    pub fn patch(&mut self, patch: &Value) -> Result<(), Error> {
        match (self, patch) {
            (Value::Text(a), Value::Text(b)) => merge(a, b),
            (Value::Warehouse(a), Value::Warehouse(b)) => {
                merge(&mut a.name, &b.name);
                merge(&mut a.tax, &b.tax);
                merge(&mut a.ytd, &b.ytd);
            }
            (Value::District(a), Value::District(b)) => {
                merge(&mut a.name, &b.name);
                merge(&mut a.tax, &b.tax);
                merge(&mut a.ytd, &b.ytd);
                merge(&mut a.next_o_id, &b.next_o_id);
            }
            (Value::Customer(a), Value::Customer(b)) => {
                merge(&mut a.first, &b.first);
                merge(&mut a.last, &b.last);
                merge(&mut a.credit, &b.credit);
                merge(&mut a.discount, &b.discount);
                merge(&mut a.balance, &b.balance);
                merge(&mut a.ytd_payment, &b.ytd_payment);
                merge(&mut a.payment_cnt, &b.payment_cnt);
                merge(&mut a.delivery_cnt, &b.delivery_cnt);
                merge(&mut a.data, &b.data);
            }
            (Value::Item(a), Value::Item(b)) => {
                merge(&mut a.im_id, &b.im_id);
                merge(&mut a.name, &b.name);
                merge(&mut a.price, &b.price);
                merge(&mut a.data, &b.data);
            }
            (Value::Stock(a), Value::Stock(b)) => {
                merge(&mut a.quantity, &b.quantity);
                merge(&mut a.ytd, &b.ytd);
                merge(&mut a.order_cnt, &b.order_cnt);
                merge(&mut a.remote_cnt, &b.remote_cnt);
                merge(&mut a.data, &b.data);
            }
            (Value::History(a), Value::History(b)) => {
                merge(&mut a.amount, &b.amount);
                merge(&mut a.data, &b.data);
            }
            (Value::NewOrder(_), Value::NewOrder(_)) => (),
            (Value::Order(a), Value::Order(b)) => {
                merge(&mut a.c_id, &b.c_id);
                merge(&mut a.entry_d, &b.entry_d);
                merge(&mut a.carrier_id, &b.carrier_id);
                merge(&mut a.ol_cnt, &b.ol_cnt);
                merge(&mut a.all_local, &b.all_local);
            }
            (Value::OrderLine(a), Value::OrderLine(b)) => {
                merge(&mut a.i_id, &b.i_id);
                merge(&mut a.supply_w_id, &b.supply_w_id);
                merge(&mut a.delivery_d, &b.delivery_d);
                merge(&mut a.quantity, &b.quantity);
                merge(&mut a.amount, &b.amount);
                merge(&mut a.dist_info, &b.dist_info);
            }
            _ => return Err(Error::TypeMismatch),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn patch_keeps_fields_left_at_default() {
        let mut d = Value::District(District {
            w_id: 1,
            d_id: 3,
            name: "dist".into(),
            tax: 0.1,
            ytd: 30000.0,
            next_o_id: 3001,
        });
        let p = Value::District(District {
            w_id: 1,
            d_id: 3,
            next_o_id: 3002,
            ..Default::default()
        });
        d.patch(&p).unwrap();
        match d {
            Value::District(d) => {
                assert_eq!(d.next_o_id, 3002);
                assert_eq!(d.tax, 0.1);
                assert_eq!(d.ytd, 30000.0);
                assert_eq!(d.name, "dist");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn patch_across_tables_is_rejected() {
        let mut v = Value::Text("a".into());
        let p = Value::Stock(Stock::default());
        assert_eq!(v.patch(&p), Err(Error::TypeMismatch));
    }
}
