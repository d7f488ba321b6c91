use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use taskforge::prelude::*;

#[derive(Debug, Serialize, Deserialize)]
struct HelloTask {
    name: String,
    message: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ForgeConfig {
        queues: QueueConfig::with_queues([("critical", 6), ("default", 3), ("low", 1)]),
        ..ForgeConfig::development()
    };
    config.logging.init();

    let mux = ServeMux::new();
    mux.handle_func("hello", |ctx: TaskContext, task: Task| async move {
        let hello: HelloTask = task.payload_json()?;
        println!("👋 Hello {}: {}", hello.name, hello.message);

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                println!("✅ Task completed for {}", hello.name);
                Ok(())
            }
            err = ctx.done() => Err(err),
        }
    });
    mux.handle_func("flaky:", |ctx: TaskContext, _task: Task| async move {
        Err(ForgeError::task_failed(format!(
            "attempt {} of {} failed",
            ctx.retry_count() + 1,
            ctx.max_retry() + 1
        )))
    });
    mux.use_middleware(|next: Arc<dyn Handler>| -> Arc<dyn Handler> {
        Arc::new(handler_fn(move |ctx: TaskContext, task: Task| {
            let next = next.clone();
            async move {
                let started = std::time::Instant::now();
                let result = next.process_task(&ctx, &task).await;
                tracing::info!(
                    task_id = ctx.task_id(),
                    task_type = task.type_name(),
                    elapsed = ?started.elapsed(),
                    ok = result.is_ok(),
                    "Processed task"
                );
                result
            }
        }))
    });

    let broker: Arc<dyn Broker> = Arc::new(InMemoryBroker::new());
    let client = Client::from_config(broker.clone(), &config);

    for (i, queue) in ["critical", "default", "low"].into_iter().enumerate() {
        let task = Task::json(
            "hello",
            &HelloTask {
                name: format!("worker-{i}"),
                message: format!("from the {queue} queue"),
            },
        )?;
        client
            .enqueue(task, EnqueueOptions::new().queue(queue))
            .await?;
    }
    client
        .enqueue(
            Task::new("hello", br#"{"name":"later","message":"scheduled"}"#.to_vec()),
            EnqueueOptions::new().process_in(Duration::from_secs(3)),
        )
        .await?;
    client
        .enqueue(
            Task::new("flaky:upload", Vec::new()),
            EnqueueOptions::new().max_retry(2).queue("low"),
        )
        .await?;

    let engine = Engine::new(config, broker, Arc::new(mux));
    engine.start().await?;

    println!("🔨 Taskforge is running! Press Ctrl+C to stop...");
    engine.wait_for_signal().await?;
    println!("🔨 Taskforge stopped");
    Ok(())
}
