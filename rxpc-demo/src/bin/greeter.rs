use clap::Parser;
use futures_util::{StreamExt, stream};
use rxpc::{ClientConfig, LocalChannelConfig};
use rxpc_demo::{Greeter, HelloReply, HelloRequest, from_message, to_message};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Name to greet.
    #[arg(default_value = "Brody")]
    pub name: String,

    /// Number of greetings sayMultiHello streams back.
    #[arg(short, long, default_value_t = 3)]
    pub num_greetings: usize,

    /// Keep the greeting stream open after the last greeting.
    #[arg(long, default_value_t = false)]
    pub no_complete: bool,

    /// Stop reading after this many greetings (0 reads them all).
    #[arg(short, long, default_value_t = 0)]
    pub take: usize,

    /// Milliseconds between two greetings.
    #[arg(long, default_value = "100")]
    pub interval_ms: u64,

    #[command(flatten)]
    pub client: ClientConfig,

    #[command(flatten)]
    pub channel: LocalChannelConfig,
}

#[tokio::main]
async fn main() -> rxpc::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();
    let greeter = Greeter::start(&args.client, &args.channel);

    let mut replies = greeter
        .method("sayHello")?
        .unary(to_message(&HelloRequest::new(&args.name))?)?;
    while let Some(reply) = replies.next().await {
        let reply: HelloReply = from_message(reply?)?;
        tracing::info!("sayHello: {}", reply.message);
    }

    let mut request = HelloRequest::new(&args.name)
        .with_greetings(args.num_greetings)
        .with_interval(args.interval_ms);
    let mut take = args.take;
    if args.no_complete {
        request = request.held();
        if take == 0 {
            tracing::warn!("held stream never completes, stopping after {} greetings", args.num_greetings);
            take = args.num_greetings;
        }
    }
    let replies = greeter.method("sayMultiHello")?.unary(to_message(&request)?)?;
    let mut replies = if take > 0 {
        replies.take(take).boxed()
    } else {
        replies.boxed()
    };
    while let Some(reply) = replies.next().await {
        let reply: HelloReply = from_message(reply?)?;
        tracing::info!("sayMultiHello: {}", reply.message);
    }
    drop(replies);
    tracing::info!(
        "in flight: {} client calls, {} held",
        greeter.api.registry().len(),
        greeter.server.held().len()
    );

    let names = ["Ann", "Bob", args.name.as_str()];
    let requests: Vec<_> = names
        .iter()
        .map(|name| to_message(&HelloRequest::new(name)))
        .collect();
    let mut replies = greeter.method("streamSayHello")?.streaming(stream::iter(requests))?;
    while let Some(reply) = replies.next().await {
        let reply: HelloReply = from_message(reply?)?;
        tracing::info!("streamSayHello: {}", reply.message);
    }

    greeter.server.shutdown().await;
    Ok(())
}
