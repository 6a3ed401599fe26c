use std::{env, time::Duration};

use bytes::Bytes;
use ferry::prelude::{BrokerAddress, Error, ProducerBuilder, TcpConfig, TcpConnection};

const KAFKA_BROKERS: &str = "KAFKA_BROKERS";
const KAFKA_TOPIC: &str = "KAFKA_TOPIC";

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let seeds = env::var(KAFKA_BROKERS)
        .unwrap_or_else(|_| "127.0.0.1:9092".to_string())
        .split(',')
        .map(str::parse::<BrokerAddress>)
        .collect::<Result<Vec<_>, _>>()?;
    let topic_name = env::var(KAFKA_TOPIC).unwrap_or_else(|_| "purchases".to_string());

    tracing::info!("Connecting to cluster");
    let producer = ProducerBuilder::<TcpConnection>::new(TcpConfig::new("ferry-demo"), seeds)
        .max_buffer_bytes(1024)
        .max_buffer_time(Duration::from_millis(50))
        .build()
        .await
        .map_err(|err| {
            tracing::error!("{:?}", err);
            err
        })?;

    let outcomes = producer.errors().clone();
    let reporter = tokio::spawn(async move {
        let (mut written, mut lost) = (0, 0);
        while let Some(outcome) = outcomes.recv().await {
            match outcome {
                Ok(()) => written += 1,
                Err(err) => {
                    lost += 1;
                    tracing::warn!("Record lost: {}", err);
                }
            }
        }
        tracing::info!("{} records written, {} lost", written, lost);
    });

    for round in 0..100 {
        tracing::info!("Producing 3 records to topic {}", topic_name);
        for n in 1..=3 {
            producer
                .send_message(
                    &topic_name,
                    Some(Bytes::from(format!("Tester {}", round % 4))),
                    format!("Value {n}"),
                )
                .await?;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    producer.close().await?;
    if let Err(err) = reporter.await {
        tracing::error!("Reporter died: {:?}", err);
    }
    Ok(())
}
