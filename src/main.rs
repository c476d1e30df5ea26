use anyhow::Context;
use chat_callkit::calls::{CallKitListener, GroupProfile, RtcEngine};
use chat_callkit::loopback::{
    LoopbackMediaServer, LoopbackNetwork, LoopbackTokenProvider, StaticGroupDirectory,
    StaticUserDirectory,
};
use chat_callkit::types::{CallErrorKind, CallId, CallType, EndCallReason, UserInfo};
use chat_callkit::{CallExt, CallKit, CallKitConfig, CallSession, CallState};
use chrono::Local;
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// Runs call scenarios between in-process call kits over the loopback network.
//
// Usage:
//   cargo run -- single                       # audio call, callee answers
//   cargo run -- single --video --callee refuse
//   cargo run -- group -n 4                   # group call with 3 invitees
//   cargo run -- --config callkit.json single --callee ignore

#[derive(Parser)]
#[command(name = "callkit-demo", about = "Loopback call signaling demo")]
struct Cli {
    /// JSON configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Seconds to stay connected before hanging up.
    #[arg(long, global = true, default_value_t = 2)]
    talk_secs: u64,

    #[command(subcommand)]
    command: Scenario,
}

#[derive(Subcommand)]
enum Scenario {
    /// One-to-one call between alice and bob.
    Single {
        #[arg(long)]
        video: bool,
        #[arg(long, value_enum, default_value_t = CalleeAction::Answer)]
        callee: CalleeAction,
    },
    /// Group call from alice to the rest of the group.
    Group {
        /// Total group size, including the caller.
        #[arg(short = 'n', long, default_value_t = 3)]
        members: usize,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CalleeAction {
    Answer,
    Refuse,
    Ignore,
}

/// Prints what a host UI would show.
struct ConsoleListener {
    user: String,
}

#[async_trait::async_trait]
impl CallKitListener for ConsoleListener {
    async fn on_received_call(&self, user_id: &str, call_type: CallType, _ext: &CallExt) {
        info!("[{}] incoming {call_type} call from {user_id}", self.user);
    }

    async fn on_remote_user_joined(&self, user_id: &str, _call_type: CallType, channel: &str) {
        info!("[{}] {user_id} joined {channel}", self.user);
    }

    async fn on_remote_user_left(&self, user_id: &str, _call_type: CallType, channel: &str) {
        info!("[{}] {user_id} left {channel}", self.user);
    }

    async fn on_end_call_with_reason(&self, reason: EndCallReason, call: &CallSession) {
        info!(
            "[{}] call {} ended: {reason}, {} members, duration {:?}s",
            self.user,
            call.call_id,
            call.members().len(),
            call.duration_secs()
        );
    }

    async fn on_call_error(&self, kind: CallErrorKind, code: i32, description: &str) {
        error!("[{}] call error {kind:?}/{code}: {description}", self.user);
    }

    async fn on_rtc_engine_created(&self, _engine: Arc<dyn RtcEngine>) {
        info!("[{}] rtc engine ready", self.user);
    }

    async fn on_call_state_changed(&self, call_id: &CallId, state: CallState) {
        info!("[{}] call {call_id} -> {state:?}", self.user);
    }
}

struct Demo {
    network: Arc<LoopbackNetwork>,
    media: Arc<LoopbackMediaServer>,
    tokens: Arc<LoopbackTokenProvider>,
    groups: Arc<StaticGroupDirectory>,
    users: Arc<StaticUserDirectory>,
    config: CallKitConfig,
}

impl Demo {
    fn new(config: CallKitConfig) -> Self {
        Self {
            network: LoopbackNetwork::new(),
            media: LoopbackMediaServer::new(),
            tokens: LoopbackTokenProvider::new(),
            groups: StaticGroupDirectory::new(),
            users: StaticUserDirectory::new(),
            config,
        }
    }

    fn kit(&self, user: &str) -> anyhow::Result<CallKit> {
        self.users
            .insert(UserInfo::new(user).with_nickname(capitalize(user)));
        let kit = CallKit::builder(user, format!("{user}-phone"))
            .config(self.config.clone())
            .transport(self.network.transport())
            .token_provider(self.tokens.clone())
            .engine_factory(self.media.factory())
            .group_directory(self.groups.clone())
            .user_info_provider(self.users.clone())
            .listener(Arc::new(ConsoleListener {
                user: user.to_string(),
            }))
            .build()
            .with_context(|| format!("building call kit for {user}"))?;
        self.network.attach(&kit);
        Ok(kit)
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

async fn wait_for(kit: &CallKit, state: CallState, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if kit.state().await == state {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn run_single(
    demo: &Demo,
    video: bool,
    callee: CalleeAction,
    talk: Duration,
) -> anyhow::Result<()> {
    let alice = demo.kit("alice")?;
    let bob = demo.kit("bob")?;

    let call_type = if video {
        CallType::SingleVideo
    } else {
        CallType::SingleAudio
    };
    let call_id = alice.start_single_call("bob", call_type, CallExt::new()).await?;
    info!("alice started call {call_id}");

    if !wait_for(&bob, CallState::Ringing, Duration::from_secs(2)).await {
        anyhow::bail!("bob never started ringing");
    }

    match callee {
        CalleeAction::Answer => {
            bob.answer_call().await?;
            if !wait_for(&alice, CallState::Active, Duration::from_secs(5)).await {
                anyhow::bail!("call never connected");
            }
            tokio::time::sleep(talk).await;
            alice.end_call().await?;
        }
        CalleeAction::Refuse => bob.refuse_call().await?,
        CalleeAction::Ignore => {
            let timeout = demo.config.invite_timeout() + Duration::from_secs(1);
            info!("bob ignores the call, waiting {timeout:?} for the ring timeout");
            tokio::time::sleep(timeout).await;
        }
    }

    wait_for(&alice, CallState::Idle, Duration::from_secs(2)).await;
    wait_for(&bob, CallState::Idle, Duration::from_secs(2)).await;
    Ok(())
}

async fn run_group(demo: &Demo, size: usize, talk: Duration) -> anyhow::Result<()> {
    if size < 2 {
        anyhow::bail!("a group call needs at least two members");
    }
    let names: Vec<String> = (0..size)
        .map(|i| match i {
            0 => "alice".to_string(),
            i => format!("member{i}"),
        })
        .collect();
    demo.groups.insert_group(GroupProfile {
        group_id: "team".into(),
        owner: Some(names[0].clone()),
        admins: Vec::new(),
        members: names.clone(),
    });

    let mut kits = Vec::new();
    for name in &names {
        kits.push(demo.kit(name)?);
    }

    let roster = kits[0].fetch_group_members("team").await?;
    let invitees: Vec<String> = roster
        .roster()
        .map(|m| m.user_id)
        .filter(|id| id != "alice")
        .collect();
    let call_id = kits[0]
        .start_group_call("team", invitees, CallExt::new())
        .await?;
    info!("alice started group call {call_id}");

    for kit in &kits[1..] {
        if wait_for(kit, CallState::Ringing, Duration::from_secs(2)).await {
            kit.answer_call().await?;
        }
    }
    if !wait_for(&kits[0], CallState::Active, Duration::from_secs(5)).await {
        anyhow::bail!("group call never connected");
    }
    tokio::time::sleep(talk).await;

    for kit in kits.iter().rev() {
        kit.end_call().await?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let config = match &cli.config {
        Some(path) => CallKitConfig::from_json_file(path)?,
        None => CallKitConfig::default(),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(async {
        let demo = Demo::new(config);
        let talk = Duration::from_secs(cli.talk_secs);
        match cli.command {
            Scenario::Single { video, callee } => run_single(&demo, video, callee, talk).await,
            Scenario::Group { members } => run_group(&demo, members, talk).await,
        }
    })?;

    // Let the last hangups drain before the runtime goes away.
    std::thread::sleep(Duration::from_millis(100));
    Ok(())
}
