use std::sync::Arc;

use dotenvy::dotenv;
use serenity::{
    async_trait,
    client::{Client, EventHandler},
    framework::{
        standard::{
            macros::{command, group},
            Args, CommandResult,
        },
        StandardFramework,
    },
    model::{channel::Message, gateway::Ready},
    prelude::GatewayIntents,
};
use serenity::client::Context;
use serenity::framework::standard::CommandError;
use serenity::model::application::interaction::Interaction;
use serenity::model::channel::ReactionType::Unicode;
use serenity::model::guild::Guild;
use serenity::model::id::UserId;
use serenity::model::prelude::{GuildId, VoiceState};
use songbird::driver::DecodeMode;
use songbird::SerenityInit;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::chat::ChatStore;
use crate::config::Config;
use crate::controls::check_msg;
use crate::llm::ChatClient;
use crate::models::LoopMode;
use crate::player::{Players, PlayersKey};
use crate::session::{SessionError, Sessions, SessionsKey};
use crate::sources::{is_playlist_url, SourceResolver};
use crate::stt::SttClient;
use crate::tts::SpeechClient;

mod audio;
mod chat;
mod config;
mod controls;
mod llm;
mod models;
mod player;
mod session;
mod sources;
mod stt;
mod tts;
mod wake;

struct Handler;

pub struct ConfigKey;

impl serenity::prelude::TypeMapKey for ConfigKey {
    type Value = Arc<Config>;
}

/// Shared clients. The music commands work without a Groq key; the chat
/// and voice assistant commands need one and say so when it is missing.
pub struct Services {
    pub sources: Arc<SourceResolver>,
    pub chat_store: Arc<ChatStore>,
    pub chat: Option<Arc<ChatClient>>,
    pub stt: Option<Arc<SttClient>>,
    pub tts: Option<Arc<SpeechClient>>,
}

pub struct ServicesKey;

impl serenity::prelude::TypeMapKey for ServicesKey {
    type Value = Arc<Services>;
}

pub struct BotDataMap;

pub struct BotData {
    pub id: u64,
}

impl serenity::prelude::TypeMapKey for BotDataMap {
    type Value = BotData;
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        info!("{} is connected!", ready.user.name);

        let bot_data = BotData { id: ready.user.id.0 };
        let data = &mut ctx.data.write().await;
        data.insert::<BotDataMap>(bot_data);
    }

    async fn voice_state_update(&self, ctx: Context, _: Option<VoiceState>, new: VoiceState) {
        if new.channel_id.is_none() {
            let bot_id: Option<u64>;

            {
                let data = ctx.data.read().await;
                bot_id = data.get::<BotDataMap>().map(|data| data.id);
            }

            if let (Some(bot_id), Some(guild_id)) = (bot_id, new.guild_id) {
                if bot_id == new.user_id.0 {
                    info!("Bot was disconnected from voice in guild {}", guild_id.0);

                    session::stop(&ctx, guild_id).await;
                    if let Err(why) = player::clear_and_stop(&ctx, guild_id).await {
                        info!("{why:#?}");
                    }
                }
            }
        }
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::MessageComponent(component) = interaction {
            controls::handle_component(&ctx, component).await;
        }
    }
}

#[group]
#[commands(
    play, pause, resume, skip, previous, stop, queue, shuffle, loop_cmd, nowplaying, chat,
    reset, listen, stoplisten, leave, help
)]
struct General;

#[tokio::main]
async fn main() {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env().expect("Invalid configuration"));

    let framework = StandardFramework::new()
        .configure(|c| c.prefix(&config.command_prefix))
        .group(&GENERAL_GROUP);

    let intents = GatewayIntents::non_privileged()
        | GatewayIntents::MESSAGE_CONTENT;

    let groq = config.groq_api_key.clone();
    if groq.is_none() {
        info!("GROQ_API_KEY not set; chat and voice assistant commands are disabled");
    }
    let services = Services {
        sources: Arc::new(SourceResolver::new()),
        chat_store: Arc::new(ChatStore::new(config.system_prompt.clone())),
        chat: groq
            .as_ref()
            .map(|key| Arc::new(ChatClient::new(key.clone(), config.chat_model.clone()))),
        stt: groq
            .as_ref()
            .map(|key| Arc::new(SttClient::new(key.clone(), config.stt_model.clone()))),
        tts: groq.as_ref().map(|key| {
            Arc::new(SpeechClient::new(
                key.clone(),
                config.tts_model.clone(),
                config.tts_voice.clone(),
            ))
        }),
    };

    // Voice packets must be decoded for the wake word listener.
    let songbird_config = songbird::Config::default().decode_mode(DecodeMode::Decode);

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(Handler)
        .framework(framework)
        .register_songbird_from_config(songbird_config)
        .await
        .expect("Err creating client");

    {
        let mut w = client.data.write().await;

        w.insert::<ConfigKey>(config.clone());
        w.insert::<ServicesKey>(Arc::new(services));
        w.insert::<PlayersKey>(Arc::new(Players::new()));
        w.insert::<SessionsKey>(Arc::new(Sessions::new()));
    }

    tokio::spawn(async move {
        let _ = client
            .start()
            .await
            .map_err(|why| info!("Client ended: {why:?}"));
    });

    tokio::signal::ctrl_c().await.expect("Control-C interruption failed!");

    info!("Received Ctrl-C, shutting down.");
}

#[command]
#[only_in(guilds)]
async fn play(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let bot_id: Option<u64>;

    {
        let data = ctx.data.read().await;
        bot_id = data.get::<BotDataMap>().map(|data| data.id);
    }

    let loading_emoji = Unicode("⏳".to_string());
    msg.react(&ctx.http, loading_emoji.clone()).await?;

    let play_result = play_inner(ctx, msg, args).await;

    if let Some(bot_id) = bot_id {
        msg.channel_id
            .delete_reaction(&ctx.http, msg.id, Some(UserId(bot_id)), loading_emoji)
            .await?;
    }

    let answer_emoji = match &play_result {
        Ok(_) => "👍",
        Err(why) => {
            info!("play failed: {why}");
            "💀"
        }
    };

    msg.react(&ctx.http, Unicode(answer_emoji.to_string())).await?;

    Ok(())
}

async fn play_inner(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let user_input = args.message().trim();
    if user_input.is_empty() {
        check_msg(
            msg.channel_id
                .say(&ctx.http, "Give me a URL or something to search for")
                .await,
        );
        return Err(CommandError::from("No input"));
    }

    join(ctx, msg).await?;

    let guild_id = get_guild_id(ctx, msg)?;

    // Stay undeafened while the assistant needs to hear the channel.
    if !session::sessions(ctx).await.is_active(guild_id.0).await {
        deafen(ctx, msg).await?;
    }

    info!("User input is {user_input}");

    let services = services(ctx).await;
    let requested_by = Some(msg.author.name.clone());

    if is_playlist_url(user_input) {
        info!("Detected playlist in {user_input}");

        let songs = services.sources.playlist(user_input, requested_by).await?;
        let (added, started) = player::enqueue_many(ctx, guild_id, msg.channel_id, songs).await?;

        if started {
            if added > 1 {
                check_msg(
                    msg.channel_id
                        .say(
                            &ctx.http,
                            format!("Queued {} more tracks from the playlist", added - 1),
                        )
                        .await,
                );
            }
        } else {
            check_msg(
                msg.channel_id
                    .say(&ctx.http, format!("Queued {added} tracks from the playlist"))
                    .await,
            );
        }
    } else {
        let song = services.sources.resolve(user_input, requested_by).await?;
        let title = song.title.clone();
        let started = player::enqueue(ctx, guild_id, msg.channel_id, song).await?;

        if !started {
            check_msg(
                msg.channel_id
                    .say(&ctx.http, format!("Added to queue: **{title}**"))
                    .await,
            );
        }
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn pause(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    if player::pause(ctx, guild_id).await? {
        msg.react(&ctx.http, Unicode("⏸".to_string())).await?;
    } else {
        check_msg(msg.channel_id.say(&ctx.http, "o_O Already stopped").await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases(unpause)]
async fn resume(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    if player::resume(ctx, guild_id).await? {
        msg.react(&ctx.http, Unicode("▶".to_string())).await?;
    } else {
        check_msg(msg.channel_id.say(&ctx.http, "o_O Already stopped").await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases(next)]
async fn skip(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    info!("SKIP - invoked from guild {}!", guild_id.0);

    if player::skip(ctx, guild_id).await? {
        msg.react(&ctx.http, Unicode("⏭".to_string())).await?;
    } else {
        check_msg(msg.channel_id.say(&ctx.http, "Nothing to skip").await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases(prev)]
async fn previous(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    if !player::previous(ctx, guild_id, msg.channel_id).await? {
        check_msg(
            msg.channel_id
                .say(&ctx.http, "There is no previous track")
                .await,
        );
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn stop(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let removed = player::clear_and_stop(ctx, guild_id).await?;
    check_msg(
        msg.channel_id
            .say(
                &ctx.http,
                format!("Stopped playback and cleared {removed} songs"),
            )
            .await,
    );

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn queue(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let (songs, loop_mode) = player::queue_snapshot(ctx, guild_id).await;

    if songs.is_empty() {
        check_msg(msg.channel_id.say(&ctx.http, "The queue is empty!").await);
    } else {
        check_msg(controls::send_queue(ctx, msg.channel_id, &songs, loop_mode).await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn shuffle(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    if player::shuffle(ctx, guild_id).await {
        msg.react(&ctx.http, Unicode("👍".to_string())).await?;
    } else {
        check_msg(
            msg.channel_id
                .say(&ctx.http, "Need at least two queued songs to shuffle")
                .await,
        );
    }

    Ok(())
}

#[command("loop")]
#[only_in(guilds)]
async fn loop_cmd(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let mode = match args.message().trim() {
        "" => player::cycle_loop(ctx, guild_id).await,
        raw => match LoopMode::parse(raw) {
            Some(mode) => player::set_loop(ctx, guild_id, mode).await,
            None => {
                check_msg(
                    msg.channel_id
                        .say(&ctx.http, "Use `loop off`, `loop song` or `loop queue`")
                        .await,
                );
                return Ok(());
            }
        },
    };

    check_msg(
        msg.channel_id
            .say(&ctx.http, format!("Loop mode: {}", mode.label()))
            .await,
    );

    Ok(())
}

#[command]
#[only_in(guilds)]
#[aliases(np)]
async fn nowplaying(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    match player::now_playing(ctx, guild_id).await {
        Some(view) => check_msg(controls::send_now_playing(ctx, msg.channel_id, &view).await),
        None => check_msg(msg.channel_id.say(&ctx.http, "Nothing is playing").await),
    }

    Ok(())
}

#[command]
async fn chat(ctx: &Context, msg: &Message, args: Args) -> CommandResult {
    let prompt = args.message().trim();
    if prompt.is_empty() {
        check_msg(msg.channel_id.say(&ctx.http, "Ask me something").await);
        return Ok(());
    }

    let services = services(ctx).await;
    let Some(chat) = services.chat.clone() else {
        check_msg(
            msg.channel_id
                .say(&ctx.http, "Chat is disabled (missing GROQ_API_KEY)")
                .await,
        );
        return Ok(());
    };

    let _ = msg.channel_id.broadcast_typing(&ctx.http).await;

    let user_id = msg.author.id.0;
    services.chat_store.push_user(user_id, prompt);
    let messages = services.chat_store.messages_for(user_id);

    match chat.complete(messages).await {
        Ok(answer) => {
            services.chat_store.push_assistant(user_id, &answer);
            for chunk in split_message(&answer) {
                check_msg(msg.channel_id.say(&ctx.http, chunk).await);
            }
        }
        Err(why) => {
            info!("chat completion failed: {why}");
            check_msg(
                msg.channel_id
                    .say(&ctx.http, "Sorry, I'm having trouble answering right now.")
                    .await,
            );
        }
    }

    Ok(())
}

#[command]
async fn reset(ctx: &Context, msg: &Message) -> CommandResult {
    let services = services(ctx).await;

    if services.chat_store.clear_user(msg.author.id.0) {
        check_msg(msg.channel_id.say(&ctx.http, "Forgot our conversation").await);
    } else {
        check_msg(msg.channel_id.say(&ctx.http, "We haven't talked yet").await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn listen(ctx: &Context, msg: &Message) -> CommandResult {
    join(ctx, msg).await?;

    let guild_id = get_guild_id(ctx, msg)?;

    // The assistant has to hear the channel.
    undeafen(ctx, msg).await?;

    let config = config(ctx).await;

    match session::start(ctx, guild_id, msg.author.id).await {
        Ok(true) => check_msg(
            msg.channel_id
                .say(
                    &ctx.http,
                    format!(
                        "Listening! Say \"{}\" to talk to me",
                        config.wake_phrase
                    ),
                )
                .await,
        ),
        Ok(false) => check_msg(msg.channel_id.say(&ctx.http, "Already listening").await),
        Err(SessionError::NotConfigured) => check_msg(
            msg.channel_id
                .say(
                    &ctx.http,
                    "The voice assistant is disabled (missing GROQ_API_KEY)",
                )
                .await,
        ),
        Err(why) => return Err(why.into()),
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn stoplisten(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    if session::stop(ctx, guild_id).await {
        check_msg(msg.channel_id.say(&ctx.http, "Stopped listening").await);
    } else {
        check_msg(msg.channel_id.say(&ctx.http, "I wasn't listening").await);
    }

    Ok(())
}

#[command]
#[only_in(guilds)]
async fn leave(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    session::stop(ctx, guild_id).await;
    if let Err(why) = player::clear_and_stop(ctx, guild_id).await {
        info!("{why:#?}");
    }

    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();

    let has_handler = manager.get(guild_id).is_some();

    if has_handler {
        if let Err(e) = manager.remove(guild_id).await {
            check_msg(msg.channel_id.say(&ctx.http, format!("Failed: {e:?}")).await);
        }

        check_msg(msg.channel_id.say(&ctx.http, "Left voice channel").await);
    } else {
        check_msg(msg.reply(ctx, "Not in a voice channel").await);
    }

    Ok(())
}

#[command]
async fn help(ctx: &Context, msg: &Message) -> CommandResult {
    let message = r#"
**Music:**
    **play [URL|Title]** - Plays (or queues) tracks from a URL or a search, playlists included.
    **pause** / **resume** - Pauses or resumes the current track.
    **skip** - Plays the next track.
    **previous** - Replays the last finished track.
    **stop** - Stops playback and clears the queue.
    **queue** - Shows the queue with page buttons.
    **shuffle** - Reorders the queue randomly.
    **loop [off|song|queue]** - Cycles or sets the loop mode.
    **nowplaying** - Shows the current track with control buttons.
**Chat:**
    **chat [MESSAGE]** - Talks with the assistant. Each user has their own short memory.
    **reset** - Clears your chat memory.
**Voice:**
    **listen** - Joins your channel and answers after the wake phrase.
    **stoplisten** - Stops the voice assistant.
    **leave** - Disconnects from the voice channel.
    "#;

    check_msg(msg.channel_id.say(&ctx.http, message).await);

    Ok(())
}

async fn join(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let channel_id = get_guild(ctx, msg)?
        .voice_states
        .get(&msg.author.id)
        .and_then(|voice_state| voice_state.channel_id);

    let connect_to = match channel_id {
        Some(channel) => channel,
        None => {
            check_msg(msg.reply(ctx, "Not in a voice channel").await);

            return Err(CommandError::from("Not in a voice channel"));
        }
    };

    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();

    let _handler = manager.join(guild_id, connect_to).await;

    Ok(())
}

async fn deafen(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();

    let handler_lock = match manager.get(guild_id) {
        Some(handler) => handler,
        None => {
            check_msg(msg.reply(ctx, "Not in a voice channel").await);

            return Ok(());
        }
    };

    let mut handler = handler_lock.lock().await;

    if handler.is_deaf() {
        info!("Already deafen!")
    } else if let Err(e) = handler.deafen(true).await {
        info!("Deafen failed due to {e:?}")
    }

    Ok(())
}

async fn undeafen(ctx: &Context, msg: &Message) -> CommandResult {
    let guild_id = get_guild_id(ctx, msg)?;

    let manager = songbird::get(ctx)
        .await
        .expect("Songbird Voice client placed in at initialisation.")
        .clone();

    let Some(handler_lock) = manager.get(guild_id) else {
        return Ok(());
    };

    let mut handler = handler_lock.lock().await;

    if handler.is_deaf() {
        if let Err(e) = handler.deafen(false).await {
            info!("Undeafen failed due to {e:?}")
        }
    }

    Ok(())
}

async fn services(ctx: &Context) -> Arc<Services> {
    ctx.data
        .read()
        .await
        .get::<ServicesKey>()
        .expect("Services placed in at initialisation.")
        .clone()
}

async fn config(ctx: &Context) -> Arc<Config> {
    ctx.data
        .read()
        .await
        .get::<ConfigKey>()
        .expect("Config placed in at initialisation.")
        .clone()
}

fn get_guild(ctx: &Context, msg: &Message) -> CommandResult<Guild> {
    msg.guild(&ctx.cache).ok_or(CommandError::from("Guild not found"))
}

fn get_guild_id(ctx: &Context, msg: &Message) -> CommandResult<GuildId> {
    let guild_id = get_guild(ctx, msg)?.id;

    Ok(guild_id)
}

/// Discord rejects messages over 2000 characters, so long answers are
/// sent in parts.
fn split_message(text: &str) -> Vec<&str> {
    const LIMIT: usize = 2000;

    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.len() > LIMIT {
        let mut cut = LIMIT;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        let (chunk, tail) = rest.split_at(cut);
        chunks.push(chunk);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::split_message;

    #[test]
    fn short_messages_stay_whole() {
        assert_eq!(split_message("hello"), vec!["hello"]);
        assert!(split_message("").is_empty());
    }

    #[test]
    fn long_messages_split_under_the_discord_limit() {
        let text = "a".repeat(4500);
        let chunks = split_message(&text);

        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 2000));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn splits_respect_char_boundaries() {
        let text = "é".repeat(1500);
        let chunks = split_message(&text);

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 2000));
        assert_eq!(chunks.concat(), text);
    }
}
