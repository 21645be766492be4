// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The fixed catalog of client operations and their execution plans.
//!
//! A plan is a deterministic function of its [Query] and of what it reads
//! through a [TxnOps]. The same plan runs in three contexts: optimistically
//! against the overlay during local execution, as a key-collecting pass in
//! high-contention mode, and against the committed store during deterministic
//! replay. Plans must not consult clocks or unseeded randomness: everything
//! that would normally be "now" or "random" is carried in the query itself so
//! every replica that re-executes it computes the same writes.

use crate::{
    Customer, District, Error, History, Item, Key, NewOrder, Order, OrderLine, Stock, Value,
    Warehouse,
};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum KvCmd {
    Get { shard: u32, key: String },
    Set { shard: u32, key: String, value: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub i_id: i64,
    pub supply_w: i64,
    pub qty: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewOrderReq {
    pub w: i64,
    pub d: i64,
    pub c: i64,
    pub items: Vec<OrderItem>,
    pub entry_date: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CustomerSelector {
    ById(i64),
    ByLastName(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentReq {
    pub w: i64,
    pub d: i64,
    pub customer: CustomerSelector,
    pub amount: f64,
    pub date: i64,
}

/// A client request. Each variant maps to exactly one execution plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Query {
    Kv(Vec<KvCmd>),
    NewOrder(NewOrderReq),
    Payment(PaymentReq),
    LoadItems { chunk: i64, seed: u64 },
    LoadWarehouse { w: i64, seed: u64 },
    LoadDistrict { w: i64, d: i64, seed: u64 },
    LoadCustomers { w: i64, d: i64, chunk: i64, seed: u64 },
    LoadStock { w: i64, chunk: i64, seed: u64 },
    LoadOrders { w: i64, d: i64, chunk: i64, seed: u64, date: i64 },
    LoadHistory { w: i64, d: i64, chunk: i64, date: i64 },
}

/// The operations a plan may perform. Implemented by the optimistic
/// transaction, the high-contention key collector, and the replay
/// transaction.
pub trait TxnOps {
    /// Reads `key`, returning `None` if it does not exist.
    fn get(&mut self, key: &Key) -> Result<Option<Value>, Error>;
    fn put(&mut self, key: Key, value: Value);
    fn patch(&mut self, key: Key, patch: Value) -> Result<(), Error>;
    /// Ids of the customers in `w`, `d` named `last` as this transaction
    /// sees them, in ascending order.
    fn customers_by_last_name(&mut self, w: i64, d: i64, last: &str) -> Vec<i64>;
}

pub const ITEMS_PER_CHUNK: i64 = 1000;
pub const CUSTOMERS_PER_CHUNK: i64 = 100;
pub const ORDERS_PER_CHUNK: i64 = 100;
pub const FIRST_NEW_ORDER: i64 = 2101;
pub const INITIAL_NEXT_O_ID: i64 = 3001;
pub const CUSTOMERS_PER_DISTRICT: i64 = 3000;

const NAME_SYLLABLES: [&str; 10] = [
    "BAR", "OUGHT", "ABLE", "PRI", "PRES", "ESE", "ANTI", "CALLY", "ATION", "EING",
];

/// The TPC-C last name for `num` in 0..1000.
pub fn last_name(num: i64) -> String {
    let n = num.rem_euclid(1000) as usize;
    let mut s = String::new();
    s.push_str(NAME_SYLLABLES[n / 100 % 10]);
    s.push_str(NAME_SYLLABLES[n / 10 % 10]);
    s.push_str(NAME_SYLLABLES[n % 10]);
    s
}

fn nurand(rng: &mut StdRng, a: i64, c: i64, x: i64, y: i64) -> i64 {
    (((rng.gen_range(0..=a) | rng.gen_range(x..=y)) + c) % (y - x + 1)) + x
}

fn alpha(rng: &mut StdRng, len: usize) -> String {
    (0..len)
        .map(|_| (b'a' + rng.gen_range(0..26u8)) as char)
        .collect()
}

fn must_get(ops: &mut dyn TxnOps, key: Key) -> Result<Value, Error> {
    ops.get(&key)?.ok_or(Error::TxnAbort)
}

fn get_warehouse(ops: &mut dyn TxnOps, w: i64) -> Result<Warehouse, Error> {
    match must_get(ops, Key::Warehouse { w })? {
        Value::Warehouse(x) => Ok(x),
        _ => Err(Error::TypeMismatch),
    }
}

fn get_district(ops: &mut dyn TxnOps, w: i64, d: i64) -> Result<District, Error> {
    match must_get(ops, Key::District { w, d })? {
        Value::District(x) => Ok(x),
        _ => Err(Error::TypeMismatch),
    }
}

fn get_customer(ops: &mut dyn TxnOps, w: i64, d: i64, c: i64) -> Result<Customer, Error> {
    match must_get(ops, Key::Customer { w, d, c })? {
        Value::Customer(x) => Ok(x),
        _ => Err(Error::TypeMismatch),
    }
}

fn get_stock(ops: &mut dyn TxnOps, w: i64, i: i64) -> Result<Stock, Error> {
    match must_get(ops, Key::Stock { w, i })? {
        Value::Stock(x) => Ok(x),
        _ => Err(Error::TypeMismatch),
    }
}

fn get_item(ops: &mut dyn TxnOps, i: i64) -> Result<Item, Error> {
    match must_get(ops, Key::Item { i })? {
        Value::Item(x) => Ok(x),
        _ => Err(Error::TypeMismatch),
    }
}

// Several customers may share a last name; by convention the one in the
// middle of the id-ordered list is chosen (the lower middle for even counts).
fn get_customer_by_last_name(
    ops: &mut dyn TxnOps,
    w: i64,
    d: i64,
    last: &str,
) -> Result<Customer, Error> {
    let ids = ops.customers_by_last_name(w, d, last);
    let mut found = Vec::with_capacity(ids.len());
    for c in ids {
        if let Some(Value::Customer(cust)) = ops.get(&Key::Customer { w, d, c })? {
            found.push(cust);
        }
    }
    if found.is_empty() {
        return Err(Error::TxnAbort);
    }
    found.sort_by_key(|c| c.c_id);
    let mut mid = found.len() / 2;
    if found.len() % 2 == 0 {
        mid -= 1;
    }
    Ok(found.swap_remove(mid))
}

/// Runs the plan for `query` against `ops`, returning the client-visible
/// result string. [Error::TxnAbort] means the plan chose not to execute.
pub fn execute(query: &Query, ops: &mut dyn TxnOps) -> Result<String, Error> {
    match query {
        Query::Kv(cmds) => kv(cmds, ops),
        Query::NewOrder(req) => new_order(req, ops),
        Query::Payment(req) => payment(req, ops),
        Query::LoadItems { chunk, seed } => load_items(*chunk, *seed, ops),
        Query::LoadWarehouse { w, seed } => load_warehouse(*w, *seed, ops),
        Query::LoadDistrict { w, d, seed } => load_district(*w, *d, *seed, ops),
        Query::LoadCustomers { w, d, chunk, seed } => load_customers(*w, *d, *chunk, *seed, ops),
        Query::LoadStock { w, chunk, seed } => load_stock(*w, *chunk, *seed, ops),
        Query::LoadOrders {
            w,
            d,
            chunk,
            seed,
            date,
        } => load_orders(*w, *d, *chunk, *seed, *date, ops),
        Query::LoadHistory { w, d, chunk, date } => load_history(*w, *d, *chunk, *date, ops),
    }
}

fn kv(cmds: &[KvCmd], ops: &mut dyn TxnOps) -> Result<String, Error> {
    let mut out = String::new();
    for cmd in cmds {
        match cmd {
            KvCmd::Get { shard, key } => {
                let k = Key::Kv {
                    shard: *shard,
                    key: key.clone(),
                };
                match ops.get(&k)? {
                    Some(_) => out.push_str("OK;"),
                    None => out.push_str("DNF;"),
                }
            }
            KvCmd::Set { shard, key, value } => {
                let k = Key::Kv {
                    shard: *shard,
                    key: key.clone(),
                };
                ops.put(k, Value::Text(value.clone()));
                out.push_str("OK;");
            }
        }
    }
    Ok(out)
}

fn new_order(req: &NewOrderReq, ops: &mut dyn TxnOps) -> Result<String, Error> {
    let (w, d) = (req.w, req.d);
    let warehouse = get_warehouse(ops, w)?;
    let district = get_district(ops, w, d)?;
    let customer = get_customer(ops, w, d, req.c)?;

    let o_id = district.next_o_id;
    ops.patch(
        Key::District { w, d },
        Value::District(District {
            w_id: w,
            d_id: d,
            next_o_id: o_id + 1,
            ..Default::default()
        }),
    )?;

    let all_local = req.items.iter().all(|it| it.supply_w == w);
    ops.put(
        Key::Order { w, d, o: o_id },
        Value::Order(Order {
            w_id: w,
            d_id: d,
            o_id,
            c_id: req.c,
            entry_d: req.entry_date,
            carrier_id: 0,
            ol_cnt: req.items.len() as i64,
            all_local,
        }),
    );
    ops.put(
        Key::NewOrder { w, d, o: o_id },
        Value::NewOrder(NewOrder {
            w_id: w,
            d_id: d,
            o_id,
        }),
    );

    let mut total = 0.0;
    for (n, it) in req.items.iter().enumerate() {
        let item = get_item(ops, it.i_id)?;
        let stock = get_stock(ops, w, it.i_id)?;
        let remaining = stock.quantity - it.qty;
        let quantity = if remaining < 10 {
            remaining + 91
        } else {
            remaining
        };
        ops.patch(
            Key::Stock { w, i: it.i_id },
            Value::Stock(Stock {
                w_id: w,
                i_id: it.i_id,
                quantity,
                ytd: stock.ytd + it.qty,
                order_cnt: stock.order_cnt + 1,
                remote_cnt: stock.remote_cnt + if it.supply_w != w { 1 } else { 0 },
                data: String::new(),
            }),
        )?;
        let amount = item.price * it.qty as f64;
        total += amount;
        let number = n as i64 + 1;
        ops.put(
            Key::OrderLine {
                w,
                d,
                o: o_id,
                number,
            },
            Value::OrderLine(OrderLine {
                w_id: w,
                d_id: d,
                o_id,
                number,
                i_id: it.i_id,
                supply_w_id: it.supply_w,
                delivery_d: 0,
                quantity: it.qty,
                amount,
                dist_info: format!("d{:02}", d),
            }),
        );
    }
    let total = total * (1.0 + warehouse.tax + district.tax) * (1.0 - customer.discount);
    Ok(format!("OK;{};{:.2}", o_id, total))
}

fn payment(req: &PaymentReq, ops: &mut dyn TxnOps) -> Result<String, Error> {
    let (w, d) = (req.w, req.d);
    let warehouse = get_warehouse(ops, w)?;
    let district = get_district(ops, w, d)?;
    ops.patch(
        Key::Warehouse { w },
        Value::Warehouse(Warehouse {
            w_id: w,
            ytd: warehouse.ytd + req.amount,
            ..Default::default()
        }),
    )?;
    ops.patch(
        Key::District { w, d },
        Value::District(District {
            w_id: w,
            d_id: d,
            ytd: district.ytd + req.amount,
            ..Default::default()
        }),
    )?;

    let customer = match &req.customer {
        CustomerSelector::ById(c) => get_customer(ops, w, d, *c)?,
        CustomerSelector::ByLastName(last) => get_customer_by_last_name(ops, w, d, last)?,
    };
    let c = customer.c_id;
    ops.patch(
        Key::Customer { w, d, c },
        Value::Customer(Customer {
            w_id: w,
            d_id: d,
            c_id: c,
            balance: customer.balance - req.amount,
            ytd_payment: customer.ytd_payment + req.amount,
            payment_cnt: customer.payment_cnt + 1,
            ..Default::default()
        }),
    )?;
    ops.put(
        Key::History {
            w,
            d,
            c,
            date: req.date,
        },
        Value::History(History {
            c_id: c,
            c_d_id: d,
            c_w_id: w,
            d_id: d,
            w_id: w,
            date: req.date,
            amount: req.amount,
            data: format!("{}    {}", warehouse.name, district.name),
        }),
    );
    Ok(format!("OK;{};{:.2}", c, customer.balance - req.amount))
}

fn load_items(chunk: i64, seed: u64, ops: &mut dyn TxnOps) -> Result<String, Error> {
    let mut rng = StdRng::seed_from_u64(seed);
    for n in chunk * ITEMS_PER_CHUNK..(chunk + 1) * ITEMS_PER_CHUNK {
        let i = n + 1;
        ops.put(
            Key::Item { i },
            Value::Item(Item {
                i_id: i,
                im_id: rng.gen_range(1..=10000),
                name: alpha(&mut rng, 14),
                price: rng.gen_range(100..=10000) as f64 / 100.0,
                data: alpha(&mut rng, 26),
            }),
        );
    }
    Ok("OK;".into())
}

fn load_warehouse(w: i64, seed: u64, ops: &mut dyn TxnOps) -> Result<String, Error> {
    let mut rng = StdRng::seed_from_u64(seed);
    ops.put(
        Key::Warehouse { w },
        Value::Warehouse(Warehouse {
            w_id: w,
            name: alpha(&mut rng, 8),
            tax: rng.gen_range(0..=2000) as f64 / 10000.0,
            ytd: 300000.0,
        }),
    );
    Ok("OK;".into())
}

fn load_district(w: i64, d: i64, seed: u64, ops: &mut dyn TxnOps) -> Result<String, Error> {
    let mut rng = StdRng::seed_from_u64(seed);
    ops.put(
        Key::District { w, d },
        Value::District(District {
            w_id: w,
            d_id: d,
            name: alpha(&mut rng, 8),
            tax: rng.gen_range(0..=2000) as f64 / 10000.0,
            ytd: 30000.0,
            next_o_id: INITIAL_NEXT_O_ID,
        }),
    );
    Ok("OK;".into())
}

fn load_customers(
    w: i64,
    d: i64,
    chunk: i64,
    seed: u64,
    ops: &mut dyn TxnOps,
) -> Result<String, Error> {
    let mut rng = StdRng::seed_from_u64(seed);
    for n in chunk * CUSTOMERS_PER_CHUNK..(chunk + 1) * CUSTOMERS_PER_CHUNK {
        let c = n + 1;
        let last = if c <= 1000 {
            last_name(c - 1)
        } else {
            last_name(nurand(&mut rng, 255, 157, 0, 999))
        };
        let credit = if rng.gen_range(0..10) == 0 { "BC" } else { "GC" };
        ops.put(
            Key::Customer { w, d, c },
            Value::Customer(Customer {
                w_id: w,
                d_id: d,
                c_id: c,
                first: alpha(&mut rng, 10),
                last,
                credit: credit.into(),
                discount: rng.gen_range(0..=5000) as f64 / 10000.0,
                balance: -10.0,
                ytd_payment: 10.0,
                payment_cnt: 1,
                delivery_cnt: 0,
                data: alpha(&mut rng, 40),
            }),
        );
    }
    Ok("OK;".into())
}

fn load_stock(w: i64, chunk: i64, seed: u64, ops: &mut dyn TxnOps) -> Result<String, Error> {
    let mut rng = StdRng::seed_from_u64(seed);
    for n in chunk * ITEMS_PER_CHUNK..(chunk + 1) * ITEMS_PER_CHUNK {
        let i = n + 1;
        ops.put(
            Key::Stock { w, i },
            Value::Stock(Stock {
                w_id: w,
                i_id: i,
                quantity: rng.gen_range(10..=100),
                ytd: 0,
                order_cnt: 0,
                remote_cnt: 0,
                data: alpha(&mut rng, 26),
            }),
        );
    }
    Ok("OK;".into())
}

fn load_orders(
    w: i64,
    d: i64,
    chunk: i64,
    seed: u64,
    date: i64,
    ops: &mut dyn TxnOps,
) -> Result<String, Error> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut customers: Vec<i64> = (1..=CUSTOMERS_PER_DISTRICT).collect();
    customers.shuffle(&mut rng);
    for n in chunk * ORDERS_PER_CHUNK..(chunk + 1) * ORDERS_PER_CHUNK {
        let o = n + 1;
        let delivered = o < FIRST_NEW_ORDER;
        let entry_d = date - rng.gen_range(0..=365) * 86400;
        let ol_cnt = rng.gen_range(5..=15);
        ops.put(
            Key::Order { w, d, o },
            Value::Order(Order {
                w_id: w,
                d_id: d,
                o_id: o,
                c_id: customers[(n as usize) % customers.len()],
                entry_d,
                carrier_id: if delivered { rng.gen_range(1..=10) } else { 0 },
                ol_cnt,
                all_local: true,
            }),
        );
        for number in 1..=ol_cnt {
            ops.put(
                Key::OrderLine { w, d, o, number },
                Value::OrderLine(OrderLine {
                    w_id: w,
                    d_id: d,
                    o_id: o,
                    number,
                    i_id: rng.gen_range(1..=100000),
                    supply_w_id: w,
                    delivery_d: if delivered { entry_d } else { 0 },
                    quantity: 5,
                    amount: if delivered {
                        0.0
                    } else {
                        rng.gen_range(1..=999999) as f64 / 100.0
                    },
                    dist_info: alpha(&mut rng, 24),
                }),
            );
        }
        if !delivered {
            ops.put(
                Key::NewOrder { w, d, o },
                Value::NewOrder(NewOrder {
                    w_id: w,
                    d_id: d,
                    o_id: o,
                }),
            );
        }
    }
    Ok("OK;".into())
}

fn load_history(
    w: i64,
    d: i64,
    chunk: i64,
    date: i64,
    ops: &mut dyn TxnOps,
) -> Result<String, Error> {
    for n in chunk * CUSTOMERS_PER_CHUNK..(chunk + 1) * CUSTOMERS_PER_CHUNK {
        let c = n + 1;
        ops.put(
            Key::History { w, d, c, date },
            Value::History(History {
                c_id: c,
                c_d_id: d,
                c_w_id: w,
                d_id: d,
                w_id: w,
                date,
                amount: 10.0,
                data: format!("Initial payment for customer {}", c),
            }),
        );
    }
    Ok("OK;".into())
}
