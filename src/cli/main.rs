use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use proximo_gateway::grpc::message_sink_client::MessageSinkClient;
use proximo_gateway::grpc::message_source_client::MessageSourceClient;
use proximo_gateway::grpc::proto::{
    Confirmation, ConsumerRequest, Message, Offset, PublisherRequest, StartConsumeRequest,
    StartPublishRequest,
};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

#[derive(Parser)]
#[command(name = "proximo-cli")]
#[command(about = "Consume from and produce to a proximo gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:6868")]
    endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print messages of a topic, confirming each one
    Consume {
        #[arg(short, long)]
        topic: String,

        /// Consumer group
        #[arg(short, long)]
        consumer: String,

        #[arg(short, long, value_enum, default_value = "default")]
        offset: OffsetArg,

        /// Stop after this many messages
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },

    /// Publish stdin lines to a topic
    Produce {
        #[arg(short, long)]
        topic: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OffsetArg {
    Default,
    Oldest,
    Newest,
}

impl From<OffsetArg> for Offset {
    fn from(offset: OffsetArg) -> Self {
        match offset {
            OffsetArg::Default => Offset::Default,
            OffsetArg::Oldest => Offset::Oldest,
            OffsetArg::Newest => Offset::Newest,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Consume {
            topic,
            consumer,
            offset,
            count,
        } => consume(&cli.endpoint, topic, consumer, offset, count).await,
        Commands::Produce { topic } => produce(&cli.endpoint, topic).await,
    }
}

async fn consume(
    endpoint: &str,
    topic: String,
    consumer: String,
    offset: OffsetArg,
    count: Option<u64>,
) -> anyhow::Result<()> {
    let mut client = MessageSourceClient::connect(endpoint.to_string())
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;

    let (requests, outbound) = mpsc::channel(16);
    requests
        .send(ConsumerRequest {
            start_request: Some(StartConsumeRequest {
                topic,
                consumer,
                initial_offset: Offset::from(offset) as i32,
            }),
            confirmation: None,
        })
        .await?;

    let mut inbound = client
        .consume(ReceiverStream::new(outbound))
        .await
        .context("Consume request rejected")?
        .into_inner();

    let mut received = 0u64;
    let mut stdout = std::io::stdout();
    while let Some(message) = inbound.message().await? {
        stdout.write_all(&message.data)?;
        stdout.write_all(b"\n")?;
        stdout.flush()?;

        requests
            .send(ConsumerRequest {
                start_request: None,
                confirmation: Some(Confirmation { msg_id: message.id }),
            })
            .await?;

        received += 1;
        if count.is_some_and(|count| received >= count) {
            break;
        }
    }

    Ok(())
}

async fn produce(endpoint: &str, topic: String) -> anyhow::Result<()> {
    let mut client = MessageSinkClient::connect(endpoint.to_string())
        .await
        .with_context(|| format!("Failed to connect to {}", endpoint))?;

    let (requests, outbound) = mpsc::channel(16);
    requests
        .send(PublisherRequest {
            start_request: Some(StartPublishRequest { topic }),
            msg: None,
        })
        .await?;

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut sequence = 0u64;
        while let Some(line) = lines.next_line().await? {
            sequence += 1;
            let request = PublisherRequest {
                start_request: None,
                msg: Some(Message {
                    data: line.into_bytes(),
                    id: sequence.to_string(),
                }),
            };
            if requests.send(request).await.is_err() {
                break;
            }
        }
        Ok::<_, std::io::Error>(())
    });

    let mut confirmations = client
        .publish(ReceiverStream::new(outbound))
        .await
        .context("Publish request rejected")?
        .into_inner();

    while let Some(confirmation) = confirmations.message().await? {
        println!("confirmed {}", confirmation.msg_id);
    }

    reader.await??;
    Ok(())
}
