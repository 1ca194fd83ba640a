//! End-to-end saga tests: both services wired to one in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use broker::{InMemoryBroker, MessageBroker};
use chrono::Utc;
use common::{GoodsId, OrderId, UserId};
use saga::{
    CreateOrder, DeadLetter, DispatcherBuilder, EventType, GoodsCreated, GoodsRejected,
    GoodsReservationHandler, IgnoreReason, MetricEvent, OrderCreated, OrderCreationHandler,
    OrderOutcomeHandler, OutboxRelay, PublishMode, RecordingMetrics, SagaError, SagaEvent,
    StuckOrderSweep, Topics,
};
use store::{
    GoodsInventory, InMemoryGoodsInventory, InMemoryOrderStore, NewOrder, Order, OrderStatus,
    OrderStore,
};

const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    broker: InMemoryBroker,
    orders: InMemoryOrderStore,
    inventory: InMemoryGoodsInventory,
    order_metrics: Arc<RecordingMetrics>,
    goods_metrics: Arc<RecordingMetrics>,
    creation: OrderCreationHandler,
}

impl Harness {
    async fn new(stock: &[(i64, i64)], mode: PublishMode) -> Self {
        let broker = InMemoryBroker::with_config(4, Duration::from_millis(5));
        let orders = InMemoryOrderStore::new();
        let inventory = InMemoryGoodsInventory::with_stock(
            stock.iter().map(|(id, qty)| (GoodsId::new(*id), *qty)),
        );
        let topics = Topics::default();
        let order_metrics = Arc::new(RecordingMetrics::new());
        let goods_metrics = Arc::new(RecordingMetrics::new());

        let creation = OrderCreationHandler::new(
            Arc::new(orders.clone()),
            Arc::new(broker.clone()),
            topics.clone(),
            mode,
            order_metrics.clone(),
        );

        let order_consumer = DispatcherBuilder::new(topics.clone(), order_metrics.clone())
            .expect(&[EventType::GoodsCreated, EventType::GoodsRejected])
            .register(Arc::new(OrderOutcomeHandler::new(
                Arc::new(orders.clone()),
                order_metrics.clone(),
            )))
            .dead_letters(Arc::new(broker.clone()))
            .build()
            .unwrap();
        Arc::new(order_consumer)
            .subscribe(&broker, "order-service")
            .await
            .unwrap();

        let goods_consumer = DispatcherBuilder::new(topics.clone(), goods_metrics.clone())
            .expect(&[EventType::OrderCreated])
            .register(Arc::new(GoodsReservationHandler::new(
                Arc::new(inventory.clone()),
                Arc::new(broker.clone()),
                topics,
                goods_metrics.clone(),
            )))
            .dead_letters(Arc::new(broker.clone()))
            .build()
            .unwrap();
        Arc::new(goods_consumer)
            .subscribe(&broker, "goods-service")
            .await
            .unwrap();

        Self {
            broker,
            orders,
            inventory,
            order_metrics,
            goods_metrics,
            creation,
        }
    }

    async fn create(&self, goods: &[i64]) -> saga::Result<Order> {
        let request = CreateOrder::new(
            UserId::new(42),
            goods.iter().copied().map(GoodsId::new).collect(),
        )?;
        self.creation.create(request).await
    }

    async fn settle(&self) {
        assert!(
            self.broker.wait_for_idle(IDLE_TIMEOUT).await,
            "saga did not settle"
        );
    }

    async fn status(&self, id: OrderId) -> OrderStatus {
        self.orders.get(id).await.unwrap().unwrap().status
    }

    async fn publish(&self, event: SagaEvent) {
        let topic = Topics::default().topic_for(event.event_type()).to_string();
        self.broker
            .publish(&topic, &event.order_id().message_key(), &event.encode().unwrap())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_available_goods_confirm_the_order() {
    let h = Harness::new(&[(1, 5), (2, 5)], PublishMode::Direct).await;

    let order = h.create(&[1, 2]).await.unwrap();
    assert_eq!(order.status, OrderStatus::Created);
    h.settle().await;

    assert_eq!(h.status(order.id).await, OrderStatus::Confirmed);
    assert_eq!(h.inventory.stock_of(GoodsId::new(1)), 4);
    assert_eq!(h.inventory.stock_of(GoodsId::new(2)), 4);

    let created: Vec<GoodsCreated> = h
        .broker
        .messages("goods.created")
        .await
        .iter()
        .map(|m| m.json::<saga::Envelope<GoodsCreated>>().unwrap().data)
        .collect();
    assert_eq!(
        created,
        vec![GoodsCreated {
            order_id: order.id,
            goods_ids: vec![GoodsId::new(1), GoodsId::new(2)],
        }]
    );
}

#[tokio::test]
async fn test_unavailable_goods_reject_the_order() {
    let h = Harness::new(&[(1, 5)], PublishMode::Direct).await;

    let order = h.create(&[1, 2]).await.unwrap();
    h.settle().await;

    assert_eq!(h.status(order.id).await, OrderStatus::Rejected);
    assert_eq!(h.inventory.stock_of(GoodsId::new(1)), 5);
    assert!(h.broker.messages("goods.created").await.is_empty());
    assert_eq!(h.broker.messages("goods.rejected").await.len(), 1);
}

#[tokio::test]
async fn test_redelivered_goods_created_leaves_order_unchanged() {
    let h = Harness::new(&[(1, 5)], PublishMode::Direct).await;
    let order = h.create(&[1]).await.unwrap();
    h.settle().await;
    let confirmed = h.orders.get(order.id).await.unwrap().unwrap();

    h.publish(SagaEvent::GoodsCreated(GoodsCreated {
        order_id: order.id,
        goods_ids: vec![GoodsId::new(1)],
    }))
    .await;
    h.settle().await;

    let after = h.orders.get(order.id).await.unwrap().unwrap();
    assert_eq!(after, confirmed);
    assert_eq!(
        h.order_metrics
            .count(|e| *e == MetricEvent::OutcomeIgnored(IgnoreReason::AlreadyTerminal)),
        1
    );
}

#[tokio::test]
async fn test_stray_goods_created_after_rejection_is_a_no_op() {
    let h = Harness::new(&[], PublishMode::Direct).await;
    let order = h.create(&[9]).await.unwrap();
    h.settle().await;
    assert_eq!(h.status(order.id).await, OrderStatus::Rejected);

    h.publish(SagaEvent::GoodsCreated(GoodsCreated {
        order_id: order.id,
        goods_ids: vec![GoodsId::new(9)],
    }))
    .await;
    h.settle().await;

    assert_eq!(h.status(order.id).await, OrderStatus::Rejected);
}

#[tokio::test]
async fn test_redelivered_order_created_reserves_once() {
    let h = Harness::new(&[(1, 1)], PublishMode::Direct).await;
    let order = h.create(&[1]).await.unwrap();
    h.settle().await;

    h.publish(SagaEvent::OrderCreated(OrderCreated {
        id: order.id,
        goods_ids: vec![GoodsId::new(1)],
    }))
    .await;
    h.settle().await;

    assert_eq!(h.status(order.id).await, OrderStatus::Confirmed);
    assert_eq!(h.inventory.stock_of(GoodsId::new(1)), 0);
    assert_eq!(h.inventory.reservation_count(), 1);

    // The replayed decision is the original one, not a rejection for lack of stock.
    assert_eq!(h.broker.messages("goods.created").await.len(), 2);
    assert!(h.broker.messages("goods.rejected").await.is_empty());
    let replayed = h.inventory.decision_for(order.id).await.unwrap().unwrap();
    assert!(replayed.is_reserved());
}

#[tokio::test]
async fn test_last_unit_goes_to_exactly_one_order() {
    let h = Harness::new(&[(1, 1)], PublishMode::Direct).await;

    let first = h.create(&[1]).await.unwrap();
    let second = h.create(&[1]).await.unwrap();
    h.settle().await;

    let mut statuses = vec![h.status(first.id).await, h.status(second.id).await];
    statuses.sort_by_key(|s| s.code());
    assert_eq!(statuses, vec![OrderStatus::Confirmed, OrderStatus::Rejected]);
    assert_eq!(h.inventory.stock_of(GoodsId::new(1)), 0);
}

#[tokio::test]
async fn test_many_orders_all_reach_a_terminal_status() {
    let h = Harness::new(&[(1, 10), (2, 1000)], PublishMode::Direct).await;

    let mut ids = Vec::new();
    for _ in 0..25 {
        ids.push(h.create(&[1, 2]).await.unwrap().id);
    }
    h.settle().await;

    let mut confirmed = 0;
    for id in ids {
        match h.status(id).await {
            OrderStatus::Confirmed => confirmed += 1,
            OrderStatus::Rejected => {}
            OrderStatus::Created => panic!("order {id} is still Created"),
        }
    }
    assert_eq!(confirmed, 10);
    assert_eq!(h.inventory.stock_of(GoodsId::new(2)), 990);
    // Outcomes only ever arrive for orders that already exist.
    assert_eq!(
        h.order_metrics
            .count(|e| *e == MetricEvent::OutcomeIgnored(IgnoreReason::OrderNotFound)),
        0
    );
}

#[tokio::test]
async fn test_orphaned_order_is_recovered_by_sweep() {
    let h = Harness::new(&[(1, 3)], PublishMode::Direct).await;
    h.broker.fail_next_publishes(1).await;

    let order_id = match h.create(&[1]).await {
        Err(SagaError::OrderOrphaned { order_id, .. }) => order_id,
        other => panic!("expected orphaned order, got {other:?}"),
    };
    h.settle().await;
    assert_eq!(h.status(order_id).await, OrderStatus::Created);
    assert_eq!(h.order_metrics.count(|e| *e == MetricEvent::OrderOrphaned), 1);

    h.orders
        .backdate(order_id, Utc::now() - chrono::Duration::minutes(10))
        .await;
    let sweep = StuckOrderSweep::new(
        Arc::new(h.orders.clone()),
        Topics::default(),
        Duration::from_secs(60),
        h.order_metrics.clone(),
    )
    .republish_with(Arc::new(h.broker.clone()));

    assert_eq!(sweep.run_once().await.unwrap(), vec![order_id]);
    h.settle().await;

    assert_eq!(h.status(order_id).await, OrderStatus::Confirmed);
    assert_eq!(h.inventory.stock_of(GoodsId::new(1)), 2);
}

#[tokio::test]
async fn test_outbox_mode_completes_after_relay() {
    let h = Harness::new(&[(1, 1)], PublishMode::Outbox).await;

    let order = h.create(&[1]).await.unwrap();
    h.settle().await;
    assert_eq!(h.status(order.id).await, OrderStatus::Created);

    let relay = OutboxRelay::new(
        Arc::new(h.orders.clone()),
        Arc::new(h.broker.clone()),
        h.order_metrics.clone(),
    );
    assert_eq!(relay.run_once().await.unwrap(), 1);
    h.settle().await;

    assert_eq!(h.status(order.id).await, OrderStatus::Confirmed);
}

#[tokio::test]
async fn test_malformed_event_is_dead_lettered_and_saga_continues() {
    let h = Harness::new(&[(1, 2)], PublishMode::Direct).await;

    h.broker
        .publish("order.created", "77", b"{\"data\": {\"id\": \"not-a-number\"}}")
        .await
        .unwrap();
    let order = h.create(&[1]).await.unwrap();
    h.settle().await;

    assert_eq!(h.status(order.id).await, OrderStatus::Confirmed);

    let parked = h.broker.messages("saga.dead-letter").await;
    assert_eq!(parked.len(), 1);
    let letter: DeadLetter = parked[0].json().unwrap();
    assert_eq!(letter.source_topic, "order.created");
    assert_eq!(letter.key.as_deref(), Some("77"));
    assert_eq!(
        h.goods_metrics
            .count(|e| *e == MetricEvent::DeadLettered("order.created".to_string())),
        1
    );
}

#[tokio::test]
async fn test_outcome_for_unknown_order_is_dropped() {
    let h = Harness::new(&[], PublishMode::Direct).await;

    h.publish(SagaEvent::GoodsRejected(GoodsRejected {
        order_id: OrderId::new(999),
        unavailable_goods_ids: vec![GoodsId::new(1)],
    }))
    .await;
    h.settle().await;

    assert_eq!(h.orders.order_count().await, 0);
    assert!(h.broker.messages("saga.dead-letter").await.is_empty());
    assert_eq!(
        h.order_metrics
            .count(|e| *e == MetricEvent::OutcomeIgnored(IgnoreReason::OrderNotFound)),
        1
    );
}

#[tokio::test]
async fn test_store_outage_is_retried_until_it_recovers() {
    let h = Harness::new(&[], PublishMode::Direct).await;
    let order = h
        .orders
        .insert(NewOrder::new(UserId::new(42), vec![GoodsId::new(1)]))
        .await
        .unwrap();
    h.orders.set_unavailable(true);
    h.publish(SagaEvent::GoodsCreated(GoodsCreated {
        order_id: order.id,
        goods_ids: vec![GoodsId::new(1)],
    }))
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(
        h.order_metrics
            .count(|e| matches!(e, MetricEvent::MessageRetried(_)))
            > 0
    );

    h.orders.set_unavailable(false);
    h.settle().await;

    assert_eq!(h.status(order.id).await, OrderStatus::Confirmed);
    assert!(h.broker.messages("saga.dead-letter").await.is_empty());
}
