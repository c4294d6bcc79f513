use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use folio::records::content::image_type_for_file_name;
use folio::records::{ContactForm, ImageAttachment, ImageError, ProjectDraft, SkillDraft};
use folio::{
    AdminApp, AdminView, ApiError, AuthError, ClientConfig, ConfigError, FeedError, FeedUpdate, FileTokenStore,
    LOGIN_PATH, Navigator, Redirected, RegistrationForm, StoreError,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("{0}; run `folio-admin login` first")]
    LoginRequired(#[from] Redirected),
    #[error("failed to read {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("cannot tell the image type of {0}; use a .jpg, .png, .gif or .webp file")]
    UnknownImageType(String),
    #[error("invalid image: {0}")]
    Image(#[from] ImageError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "folio-admin", about = "Portfolio CMS admin client")]
struct Cli {
    #[arg(long, env = "FOLIO_API_BASE_URL")]
    base_url: Option<String>,

    #[arg(long, env = "FOLIO_PUSH_URL")]
    push_url: Option<String>,

    #[arg(long, env = "FOLIO_STATE_DIR")]
    state_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Exchange a username and password for a stored session.
    Login(LoginArgs),
    Register(RegisterArgs),
    /// Forget the stored session. Always succeeds.
    Logout,
    Whoami(WhoamiArgs),
    Dashboard,
    Projects(ProjectsCommand),
    Skills(SkillsCommand),
    Contact(ContactCommand),
    Messages(MessagesCommand),
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[arg(long)]
    username: String,
    #[arg(long, env = "FOLIO_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
    #[arg(long)]
    confirm_password: String,
}

#[derive(Args, Debug)]
struct WhoamiArgs {
    /// Ask the server for the current profile instead of the stored one.
    #[arg(long)]
    refresh: bool,
}

#[derive(Args, Debug)]
struct ProjectsCommand {
    #[command(subcommand)]
    command: ProjectsSubcommand,
}

#[derive(Subcommand, Debug)]
enum ProjectsSubcommand {
    List,
    /// Public featured projects; no sign-in needed.
    Featured,
    Count,
    Get { id: String },
    Create(ProjectFields),
    Update {
        id: String,
        #[command(flatten)]
        fields: ProjectFields,
    },
    Delete { id: String },
}

#[derive(Args, Debug)]
struct ProjectFields {
    #[arg(long)]
    title: String,
    #[arg(long, default_value = "")]
    description: String,
    /// Comma-separated list, e.g. "Rust, Tokio".
    #[arg(long, default_value = "")]
    technologies: String,
    #[arg(long, default_value = "")]
    github_url: String,
    #[arg(long, default_value = "")]
    live_url: String,
    #[arg(long)]
    featured: bool,
    #[arg(long, default_value = "")]
    category: String,
    #[arg(long)]
    image: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SkillsCommand {
    #[command(subcommand)]
    command: SkillsSubcommand,
}

#[derive(Subcommand, Debug)]
enum SkillsSubcommand {
    List,
    Create(SkillFields),
    Update {
        id: String,
        #[command(flatten)]
        fields: SkillFields,
    },
    Delete { id: String },
}

#[derive(Args, Debug)]
struct SkillFields {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "")]
    category: String,
    #[arg(long)]
    proficiency: Option<u8>,
}

#[derive(Args, Debug)]
struct ContactCommand {
    #[command(subcommand)]
    command: ContactSubcommand,
}

#[derive(Subcommand, Debug)]
enum ContactSubcommand {
    /// Submit the public contact form.
    Send(ContactArgs),
}

#[derive(Args, Debug)]
struct ContactArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    email: String,
    #[arg(long)]
    message: String,
}

#[derive(Args, Debug)]
struct MessagesCommand {
    #[command(subcommand)]
    command: MessagesSubcommand,
}

#[derive(Subcommand, Debug)]
enum MessagesSubcommand {
    List,
    Unread,
    Read { id: String },
    Delete { id: String },
    /// Stream the inbox live until interrupted.
    Watch,
}

/// Redirects have no screen to land on here, so they become a hint on stderr.
struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn navigate(&self, path: &str) {
        if path == LOGIN_PATH {
            eprintln!("session is no longer valid; run `folio-admin login`");
        } else {
            eprintln!("redirected to {path}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("FOLIO_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let store = FileTokenStore::in_dir(&config.state_dir)?;
    tracing::debug!(base_url = %config.base_url, store = %store.path().display(), "starting");
    let app = AdminApp::new(config, Arc::new(store), Arc::new(TerminalNavigator))?;

    match cli.command {
        Command::Login(args) => run_login(&app, args).await,
        Command::Register(args) => run_register(&app, args).await,
        Command::Logout => {
            app.auth().logout();
            eprintln!("signed out");
            Ok(())
        }
        Command::Whoami(args) => run_whoami(&app, args).await,
        Command::Dashboard => {
            let summary = app.guard().render(AdminView::Dashboard, |_| app.dashboard()).await??;
            print_json(&summary)
        }
        Command::Projects(projects) => run_projects(&app, projects.command).await,
        Command::Skills(skills) => run_skills(&app, skills.command).await,
        Command::Contact(contact) => match contact.command {
            ContactSubcommand::Send(args) => run_contact(&app, args).await,
        },
        Command::Messages(messages) => run_messages(&app, messages.command).await,
    }
}

/// Flags win over the environment; anything not given as a flag falls back
/// to the `FOLIO_*` variables.
fn load_config(cli: &Cli) -> Result<ClientConfig, ConfigError> {
    ClientConfig::from_lookup(|key| {
        let flag = match key {
            "FOLIO_API_BASE_URL" => cli.base_url.clone(),
            "FOLIO_PUSH_URL" => cli.push_url.clone(),
            "FOLIO_STATE_DIR" => cli.state_dir.clone(),
            _ => None,
        };
        flag.or_else(|| std::env::var(key).ok())
    })
}

async fn run_login(app: &AdminApp, args: LoginArgs) -> Result<(), CliError> {
    let session = app.auth().login(&args.username, &args.password).await?;
    print_json(&session.user)?;
    eprintln!("signed in as {}", args.username);
    Ok(())
}

async fn run_register(app: &AdminApp, args: RegisterArgs) -> Result<(), CliError> {
    let form = RegistrationForm::new(args.username, args.password, args.confirm_password);
    let session = app.auth().register(&form).await?;
    print_json(&session.user)?;
    eprintln!("registered and signed in as {}", form.username);
    Ok(())
}

async fn run_whoami(app: &AdminApp, args: WhoamiArgs) -> Result<(), CliError> {
    let user = if args.refresh {
        Some(app.auth().restore_profile().await?)
    } else {
        app.auth().current_user()
    };
    match user {
        Some(user) => print_json(&user),
        None => {
            eprintln!("not signed in");
            Ok(())
        }
    }
}

async fn run_projects(app: &AdminApp, command: ProjectsSubcommand) -> Result<(), CliError> {
    let api = app.api();
    let guard = app.guard();
    match command {
        ProjectsSubcommand::Featured => print_json(&api.projects().featured().await?),
        ProjectsSubcommand::List => {
            let projects = guard.render(AdminView::Projects, |_| async { api.admin_projects().all().await }).await??;
            print_json(&projects)
        }
        ProjectsSubcommand::Count => {
            let count = guard.render(AdminView::Projects, |_| async { api.admin_projects().count().await }).await??;
            print_json(&json!({ "count": count }))
        }
        ProjectsSubcommand::Get { id } => {
            let view = AdminView::EditProject(id.clone());
            let project = guard.render(view, |_| async { api.admin_projects().get(&id).await }).await??;
            print_json(&project)
        }
        ProjectsSubcommand::Create(fields) => {
            let draft = project_draft(fields).await?;
            let project = guard
                .render(AdminView::NewProject, |_| async { api.admin_projects().create(draft).await })
                .await??;
            eprintln!("created project {}", project.id);
            print_json(&project)
        }
        ProjectsSubcommand::Update { id, fields } => {
            let draft = project_draft(fields).await?;
            let view = AdminView::EditProject(id.clone());
            let project = guard.render(view, |_| async { api.admin_projects().update(&id, draft).await }).await??;
            print_json(&project)
        }
        ProjectsSubcommand::Delete { id } => {
            guard.render(AdminView::Projects, |_| async { api.admin_projects().delete(&id).await }).await??;
            eprintln!("deleted project {id}");
            Ok(())
        }
    }
}

async fn project_draft(fields: ProjectFields) -> Result<ProjectDraft, CliError> {
    let image = match fields.image {
        Some(path) => Some(read_image(path).await?),
        None => None,
    };
    Ok(ProjectDraft {
        title: fields.title,
        description: fields.description,
        technologies: ProjectDraft::parse_technologies(&fields.technologies),
        github_url: fields.github_url,
        live_url: fields.live_url,
        featured: fields.featured,
        category: fields.category,
        image,
    })
}

async fn read_image(path: PathBuf) -> Result<ImageAttachment, CliError> {
    let file_name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
    let content_type =
        image_type_for_file_name(&file_name).ok_or_else(|| CliError::UnknownImageType(path.display().to_string()))?;
    let bytes = tokio::fs::read(&path).await.map_err(|source| CliError::ReadFile { path, source })?;
    Ok(ImageAttachment::new(file_name, content_type, bytes)?)
}

async fn run_skills(app: &AdminApp, command: SkillsSubcommand) -> Result<(), CliError> {
    let skills = app.api().admin_skills();
    let guard = app.guard();
    match command {
        SkillsSubcommand::List => {
            let all = guard.render(AdminView::Skills, |_| skills.all()).await??;
            print_json(&all)
        }
        SkillsSubcommand::Create(fields) => {
            let draft = skill_draft(fields);
            let skill = guard.render(AdminView::Skills, |_| async { skills.create(&draft).await }).await??;
            print_json(&skill)
        }
        SkillsSubcommand::Update { id, fields } => {
            let draft = skill_draft(fields);
            let skill = guard.render(AdminView::Skills, |_| async { skills.update(&id, &draft).await }).await??;
            print_json(&skill)
        }
        SkillsSubcommand::Delete { id } => {
            guard.render(AdminView::Skills, |_| async { skills.delete(&id).await }).await??;
            eprintln!("deleted skill {id}");
            Ok(())
        }
    }
}

fn skill_draft(fields: SkillFields) -> SkillDraft {
    SkillDraft { name: fields.name, category: fields.category, proficiency: fields.proficiency }
}

async fn run_contact(app: &AdminApp, args: ContactArgs) -> Result<(), CliError> {
    let form = ContactForm { name: args.name, email: args.email, message: args.message };
    app.api().contact().send(&form).await?;
    eprintln!("message sent");
    Ok(())
}

async fn run_messages(app: &AdminApp, command: MessagesSubcommand) -> Result<(), CliError> {
    let messages = app.api().messages();
    let guard = app.guard();
    match command {
        MessagesSubcommand::List => {
            let all = guard.render(AdminView::Messages, |_| messages.all()).await??;
            print_json(&all)
        }
        MessagesSubcommand::Unread => {
            let count = guard.render(AdminView::Messages, |_| messages.unread_count()).await??;
            print_json(&json!({ "unreadCount": count }))
        }
        MessagesSubcommand::Read { id } => {
            guard.render(AdminView::Messages, |_| async { messages.mark_read(&id).await }).await??;
            eprintln!("marked {id} read");
            Ok(())
        }
        MessagesSubcommand::Delete { id } => {
            guard.render(AdminView::Messages, |_| async { messages.delete(&id).await }).await??;
            eprintln!("deleted message {id}");
            Ok(())
        }
        MessagesSubcommand::Watch => guard.render(AdminView::Messages, |_| watch_messages(app)).await?,
    }
}

/// Mount a live feed and print every change as one JSON document until
/// ctrl-c or the push channel ends.
async fn watch_messages(app: &AdminApp) -> Result<(), CliError> {
    let feed = app.message_feed();
    let mut updates = feed.subscribe();
    feed.mount();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            update = updates.recv() => match update {
                Ok(FeedUpdate::Status(status)) => eprintln!("feed: {status:?}"),
                Ok(FeedUpdate::Seeded { added }) => {
                    eprintln!("loaded {added} messages");
                    print_json(&json!({ "event": "seeded", "messages": feed.messages() }))?;
                }
                Ok(FeedUpdate::SeedFailed(message)) => eprintln!("{message}"),
                Ok(FeedUpdate::Received(message)) => {
                    print_json(&json!({ "event": "newMessage", "message": message }))?;
                }
                Ok(FeedUpdate::Removed(id)) => print_json(&json!({ "event": "deleteMessage", "id": id }))?,
                Ok(FeedUpdate::MarkedRead(id)) => print_json(&json!({ "event": "read", "id": id }))?,
                Ok(FeedUpdate::ChannelClosed(reason)) => {
                    eprintln!("push channel closed: {}", reason.as_deref().unwrap_or("server went away"));
                    break;
                }
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "feed updates dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    feed.unmount();
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
