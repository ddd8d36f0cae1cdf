//! Backpressure, closing and hand-off behavior of channels.

use std::time::Duration;

use pretty_assertions::assert_eq;
use pullstream::{Channel, Error, Stream};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[tokio::test]
async fn test_sends_within_capacity_complete_immediately() {
    let channel = Channel::bounded(3);
    for n in 0..3 {
        tokio::time::timeout(Duration::from_millis(50), channel.send(n))
            .await
            .expect("send within capacity should not wait")
            .unwrap();
    }
    assert_eq!(channel.len(), 3);
}

#[tokio::test]
async fn test_send_over_capacity_waits_for_consumer() {
    let channel = Channel::bounded(2);
    channel.send(1).await.unwrap();
    channel.send(2).await.unwrap();

    let producer = channel.clone();
    let blocked = tokio::spawn(async move { producer.send(3).await });
    settle().await;
    assert!(!blocked.is_finished(), "third send should wait for room");
    assert_eq!(channel.len(), 3);

    let consumer = channel.clone();
    let received = tokio::spawn(async move { consumer.stream().take(3).compile().to_vec().await });
    blocked.await.unwrap().unwrap();
    assert_eq!(received.await.unwrap().unwrap(), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_close_lets_consumer_drain() {
    let channel = Channel::bounded(1);
    let producer = channel.clone();
    let sender = tokio::spawn(async move {
        for n in 0..10 {
            producer.send(n).await?;
        }
        producer.close();
        Ok::<_, Error>(())
    });

    let out = channel.stream().compile().to_vec().await.unwrap();
    sender.await.unwrap().unwrap();
    assert_eq!(out, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_parked_sender_is_drained_after_close() {
    let channel = Channel::bounded(0);
    let producer = channel.clone();
    let parked = tokio::spawn(async move { producer.send("late").await });
    settle().await;
    channel.close();

    let out = channel.stream().compile().to_vec().await.unwrap();
    parked.await.unwrap().unwrap();
    assert_eq!(out, vec!["late"]);
}

#[tokio::test]
async fn test_send_after_close_is_rejected() {
    let channel = Channel::bounded(4);
    channel.send(1).await.unwrap();
    assert!(channel.close());
    assert!(matches!(channel.send(2).await, Err(Error::ChannelClosed)));
    assert_eq!(channel.stream().compile().to_vec().await.unwrap(), vec![1]);
}

#[tokio::test]
async fn test_synchronous_channel_hands_off_one_at_a_time() {
    let channel = Channel::synchronous();
    assert_eq!(channel.capacity(), 0);
    assert!(!channel.try_send(1).unwrap());

    let producer = channel.clone();
    let sender = tokio::spawn(async move {
        for n in 0..5 {
            producer.send(n).await?;
        }
        producer.close();
        Ok::<_, Error>(())
    });
    let out = channel.stream().compile().to_vec().await.unwrap();
    sender.await.unwrap().unwrap();
    assert_eq!(out, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_dropped_send_withdraws_its_value() {
    let channel = Channel::bounded(1);
    channel.send(1).await.unwrap();
    let pending = tokio::time::timeout(Duration::from_millis(20), channel.send(2)).await;
    assert!(pending.is_err(), "send into a full channel should wait");
    assert_eq!(channel.len(), 1);

    channel.close();
    assert_eq!(channel.stream().compile().to_vec().await.unwrap(), vec![1]);
}

#[tokio::test]
async fn test_many_producers_deliver_everything() {
    let channel = Channel::bounded(4);
    let mut senders = Vec::new();
    for p in 0..4u32 {
        let producer = channel.clone();
        senders.push(tokio::spawn(async move {
            for n in 0..25u32 {
                producer.send(p * 100 + n).await?;
            }
            Ok::<_, Error>(())
        }));
    }
    let closer = channel.clone();
    tokio::spawn(async move {
        for sender in senders {
            let _ = sender.await;
        }
        closer.close();
    });

    let mut out = channel.stream().compile().to_vec().await.unwrap();
    out.sort_unstable();
    let mut expected: Vec<u32> = (0..4).flat_map(|p| (0..25).map(move |n| p * 100 + n)).collect();
    expected.sort_unstable();
    assert_eq!(out, expected);
}

#[tokio::test]
async fn test_channel_stream_composes_with_interruption() {
    let channel = Channel::<u8>::unbounded();
    channel.try_send(7).unwrap();
    // Never closed: the interruption ends the stream.
    let out = channel
        .stream()
        .interrupt_after(Duration::from_millis(30))
        .append(Stream::emit(8))
        .compile()
        .to_vec()
        .await
        .unwrap();
    assert_eq!(out, vec![7, 8]);
}
