use chrono::Utc;
use uuid::Uuid;

use crate::models::order::{new_tracking_token, DeliveryOrder, LineItem, OrderStatus};

pub fn sample_order(status: OrderStatus) -> DeliveryOrder {
    let items = vec![LineItem {
        product_id: Some(7),
        name: "green curry".to_string(),
        quantity: 2,
        unit_price: 210,
    }];
    let (subtotal, total_amount) = DeliveryOrder::compute_total(&items, 0, 0, 0);
    let now = Utc::now();

    DeliveryOrder {
        id: Uuid::new_v4(),
        status,
        customer_name: "Somchai".to_string(),
        customer_phone: "0812345678".to_string(),
        delivery_address: "99 Sukhumvit Rd".to_string(),
        destination: None,
        note: None,
        items,
        subtotal,
        delivery_fee: 0,
        discount: 0,
        deposit: 0,
        total_amount,
        assigned_courier: None,
        courier_position: None,
        tracking_token: new_tracking_token(),
        settlement: None,
        created_at: now,
        confirmed_at: None,
        ready_at: None,
        picked_up_at: None,
        delivery_started_at: None,
        delivered_at: None,
        completed_at: None,
        cancelled_at: None,
        updated_at: now,
    }
}
