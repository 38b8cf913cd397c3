use serenity::builder::{CreateComponents, CreateEmbed};
use serenity::client::Context;
use serenity::model::application::component::ButtonStyle;
use serenity::model::application::interaction::message_component::MessageComponentInteraction;
use serenity::model::application::interaction::InteractionResponseType;
use serenity::model::channel::Message;
use serenity::model::id::{ChannelId, GuildId};
use serenity::utils::Colour;
use serenity::Result as SerenityResult;
use tracing::info;

use crate::models::{format_duration, LoopMode, Song};
use crate::player::{self, NowPlaying};

pub const ID_PREVIOUS: &str = "music:previous";
pub const ID_PAUSE_RESUME: &str = "music:pause_resume";
pub const ID_SKIP: &str = "music:skip";
pub const ID_LOOP: &str = "music:loop";
pub const ID_SHUFFLE: &str = "music:shuffle";
pub const ID_CLEAR: &str = "music:clear";
pub const ID_QUEUE: &str = "music:queue";

pub const QUEUE_PAGE_SIZE: usize = 10;

/// Checks that a message successfully sent; if not, then logs why to stdout.
pub fn check_msg(result: SerenityResult<Message>) {
    if let Err(why) = result {
        info!("Error sending message: {why:?}");
    }
}

/// Posts the now-playing embed together with the playback control buttons.
pub async fn send_now_playing(
    ctx: &Context,
    channel_id: ChannelId,
    view: &NowPlaying,
) -> SerenityResult<Message> {
    channel_id
        .send_message(&ctx.http, |m| {
            m.embed(|e| now_playing_embed(e, view))
                .components(|c| control_rows(c, view.paused, view.loop_mode))
        })
        .await
}

fn now_playing_embed<'a>(e: &'a mut CreateEmbed, view: &NowPlaying) -> &'a mut CreateEmbed {
    e.title(if view.paused { "Paused" } else { "Now playing" })
        .description(format!("[{}]({})", view.song.title, view.song.url))
        .colour(Colour::BLURPLE)
        .field(
            "Position",
            format!(
                "{} / {}",
                format_duration(Some(view.position)),
                view.song.duration_text
            ),
            true,
        )
        .field("Loop", view.loop_mode.label(), true)
        .field("Up next", format!("{} in queue", view.upcoming), true);

    if let Some(requester) = &view.song.requested_by {
        e.field("Requested by", requester, true);
    }
    if let Some(thumbnail) = &view.song.thumbnail {
        e.thumbnail(thumbnail);
    }

    e
}

fn control_rows(
    c: &mut CreateComponents,
    paused: bool,
    loop_mode: LoopMode,
) -> &mut CreateComponents {
    c.create_action_row(|row| {
        row.create_button(|b| {
            b.custom_id(ID_PREVIOUS)
                .emoji('⏮')
                .style(ButtonStyle::Secondary)
        })
        .create_button(|b| {
            b.custom_id(ID_PAUSE_RESUME)
                .emoji(if paused { '▶' } else { '⏸' })
                .style(ButtonStyle::Primary)
        })
        .create_button(|b| {
            b.custom_id(ID_SKIP)
                .emoji('⏭')
                .style(ButtonStyle::Secondary)
        })
    })
    .create_action_row(|row| {
        row.create_button(|b| {
            b.custom_id(ID_LOOP)
                .emoji('🔁')
                .label(loop_mode.label())
                .style(if loop_mode == LoopMode::Off {
                    ButtonStyle::Secondary
                } else {
                    ButtonStyle::Success
                })
        })
        .create_button(|b| {
            b.custom_id(ID_SHUFFLE)
                .emoji('🔀')
                .style(ButtonStyle::Secondary)
        })
        .create_button(|b| {
            b.custom_id(ID_QUEUE)
                .emoji('📜')
                .style(ButtonStyle::Secondary)
        })
        .create_button(|b| {
            b.custom_id(ID_CLEAR)
                .emoji('🗑')
                .style(ButtonStyle::Danger)
        })
    })
}

fn total_pages(songs: usize) -> usize {
    ((songs + QUEUE_PAGE_SIZE - 1) / QUEUE_PAGE_SIZE).max(1)
}

fn queue_embed<'a>(
    e: &'a mut CreateEmbed,
    songs: &[Song],
    page: usize,
    loop_mode: LoopMode,
) -> &'a mut CreateEmbed {
    let pages = total_pages(songs.len());
    let lines: Vec<String> = songs
        .iter()
        .enumerate()
        .skip(page * QUEUE_PAGE_SIZE)
        .take(QUEUE_PAGE_SIZE)
        .map(|(index, song)| {
            format!(
                "`{:>2}.` [{}]({}) `{}`",
                index + 1,
                song.title,
                song.url,
                song.duration_text
            )
        })
        .collect();

    e.title("Queue")
        .description(lines.join("\n"))
        .colour(Colour::BLURPLE)
        .footer(|f| {
            f.text(format!(
                "Page {}/{} | {} songs | Loop: {}",
                page + 1,
                pages,
                songs.len(),
                loop_mode.label()
            ))
        })
}

fn queue_nav_row(c: &mut CreateComponents, page: usize, pages: usize) -> &mut CreateComponents {
    c.create_action_row(|row| {
        row.create_button(|b| {
            b.custom_id(format!("queue:prev:{page}"))
                .emoji('◀')
                .style(ButtonStyle::Secondary)
                .disabled(page == 0)
        })
        .create_button(|b| {
            b.custom_id(format!("queue:next:{page}"))
                .emoji('▶')
                .style(ButtonStyle::Secondary)
                .disabled(page + 1 >= pages)
        })
        .create_button(|b| {
            b.custom_id("queue:clear")
                .label("Clear")
                .style(ButtonStyle::Danger)
        })
    })
}

/// Posts the paginated queue embed in response to the `queue` command.
pub async fn send_queue(
    ctx: &Context,
    channel_id: ChannelId,
    songs: &[Song],
    loop_mode: LoopMode,
) -> SerenityResult<Message> {
    let pages = total_pages(songs.len());
    channel_id
        .send_message(&ctx.http, |m| {
            m.embed(|e| queue_embed(e, songs, 0, loop_mode))
                .components(|c| queue_nav_row(c, 0, pages))
        })
        .await
}

#[derive(Debug, PartialEq, Eq)]
enum QueueNav {
    Prev(usize),
    Next(usize),
    Clear,
}

fn parse_queue_nav(custom_id: &str) -> Option<QueueNav> {
    let mut parts = custom_id.split(':');
    if parts.next()? != "queue" {
        return None;
    }
    match parts.next()? {
        "clear" => Some(QueueNav::Clear),
        "prev" => parts.next()?.parse().ok().map(QueueNav::Prev),
        "next" => parts.next()?.parse().ok().map(QueueNav::Next),
        _ => None,
    }
}

/// Entry point for button presses on control and queue messages.
pub async fn handle_component(ctx: &Context, interaction: MessageComponentInteraction) {
    let Some(guild_id) = interaction.guild_id else {
        return;
    };
    let custom_id = interaction.data.custom_id.clone();

    match custom_id.as_str() {
        ID_PREVIOUS => match player::previous(ctx, guild_id, interaction.channel_id).await {
            Ok(true) => ack(ctx, &interaction).await,
            Ok(false) => notice(ctx, &interaction, "There is no previous track").await,
            Err(why) => notice(ctx, &interaction, &format!("Could not go back: {why}")).await,
        },
        ID_PAUSE_RESUME => match player::toggle_pause(ctx, guild_id).await {
            Ok(Some(_)) => refresh_now_playing(ctx, &interaction, guild_id).await,
            Ok(None) => notice(ctx, &interaction, "Nothing is playing").await,
            Err(why) => notice(ctx, &interaction, &format!("Could not toggle: {why}")).await,
        },
        ID_SKIP => match player::skip(ctx, guild_id).await {
            Ok(true) => ack(ctx, &interaction).await,
            Ok(false) => notice(ctx, &interaction, "Nothing to skip").await,
            Err(why) => notice(ctx, &interaction, &format!("Could not skip: {why}")).await,
        },
        ID_LOOP => {
            player::cycle_loop(ctx, guild_id).await;
            refresh_now_playing(ctx, &interaction, guild_id).await;
        }
        ID_SHUFFLE => {
            if player::shuffle(ctx, guild_id).await {
                notice(ctx, &interaction, "Queue shuffled").await;
            } else {
                notice(ctx, &interaction, "Need at least two songs to shuffle").await;
            }
        }
        ID_CLEAR => {
            let removed = player::clear_and_stop(ctx, guild_id).await.unwrap_or(0);
            reply(
                ctx,
                &interaction,
                &format!("Stopped playback and cleared {removed} songs"),
            )
            .await;
        }
        ID_QUEUE => {
            let (songs, loop_mode) = player::queue_snapshot(ctx, guild_id).await;
            if songs.is_empty() {
                notice(ctx, &interaction, "The queue is empty!").await;
            } else {
                send_queue_response(ctx, &interaction, &songs, 0, loop_mode).await;
            }
        }
        other => {
            if let Some(nav) = parse_queue_nav(other) {
                handle_queue_nav(ctx, &interaction, guild_id, nav).await;
            }
        }
    }
}

async fn handle_queue_nav(
    ctx: &Context,
    interaction: &MessageComponentInteraction,
    guild_id: GuildId,
    nav: QueueNav,
) {
    match nav {
        QueueNav::Clear => {
            let removed = player::clear_and_stop(ctx, guild_id).await.unwrap_or(0);
            reply(
                ctx,
                interaction,
                &format!("Stopped playback and cleared {removed} songs"),
            )
            .await;
        }
        QueueNav::Prev(page) | QueueNav::Next(page) => {
            let target = match nav {
                QueueNav::Prev(_) => page.saturating_sub(1),
                _ => page + 1,
            };
            let (songs, loop_mode) = player::queue_snapshot(ctx, guild_id).await;
            if songs.is_empty() {
                notice(ctx, interaction, "The queue is empty!").await;
                return;
            }
            // The queue may have shrunk since the buttons were posted.
            let page = target.min(total_pages(songs.len()) - 1);
            update_queue_message(ctx, interaction, &songs, page, loop_mode).await;
        }
    }
}

async fn send_queue_response(
    ctx: &Context,
    interaction: &MessageComponentInteraction,
    songs: &[Song],
    page: usize,
    loop_mode: LoopMode,
) {
    let pages = total_pages(songs.len());
    let result = interaction
        .create_interaction_response(&ctx.http, |r| {
            r.kind(InteractionResponseType::ChannelMessageWithSource)
                .interaction_response_data(|d| {
                    d.embed(|e| queue_embed(e, songs, page, loop_mode))
                        .components(|c| queue_nav_row(c, page, pages))
                })
        })
        .await;
    if let Err(why) = result {
        info!("Error responding to component: {why:?}");
    }
}

async fn update_queue_message(
    ctx: &Context,
    interaction: &MessageComponentInteraction,
    songs: &[Song],
    page: usize,
    loop_mode: LoopMode,
) {
    let pages = total_pages(songs.len());
    let result = interaction
        .create_interaction_response(&ctx.http, |r| {
            r.kind(InteractionResponseType::UpdateMessage)
                .interaction_response_data(|d| {
                    d.embed(|e| queue_embed(e, songs, page, loop_mode))
                        .components(|c| queue_nav_row(c, page, pages))
                })
        })
        .await;
    if let Err(why) = result {
        info!("Error responding to component: {why:?}");
    }
}

async fn refresh_now_playing(
    ctx: &Context,
    interaction: &MessageComponentInteraction,
    guild_id: GuildId,
) {
    let Some(view) = player::now_playing(ctx, guild_id).await else {
        ack(ctx, interaction).await;
        return;
    };

    let result = interaction
        .create_interaction_response(&ctx.http, |r| {
            r.kind(InteractionResponseType::UpdateMessage)
                .interaction_response_data(|d| {
                    d.embed(|e| now_playing_embed(e, &view))
                        .components(|c| control_rows(c, view.paused, view.loop_mode))
                })
        })
        .await;
    if let Err(why) = result {
        info!("Error responding to component: {why:?}");
    }
}

/// Acknowledges a press without changing the message; a follow-up message
/// posted by the player takes over the controls.
async fn ack(ctx: &Context, interaction: &MessageComponentInteraction) {
    let result = interaction
        .create_interaction_response(&ctx.http, |r| {
            r.kind(InteractionResponseType::DeferredUpdateMessage)
        })
        .await;
    if let Err(why) = result {
        info!("Error responding to component: {why:?}");
    }
}

async fn notice(ctx: &Context, interaction: &MessageComponentInteraction, text: &str) {
    let result = interaction
        .create_interaction_response(&ctx.http, |r| {
            r.kind(InteractionResponseType::ChannelMessageWithSource)
                .interaction_response_data(|d| d.content(text).ephemeral(true))
        })
        .await;
    if let Err(why) = result {
        info!("Error responding to component: {why:?}");
    }
}

async fn reply(ctx: &Context, interaction: &MessageComponentInteraction, text: &str) {
    let result = interaction
        .create_interaction_response(&ctx.http, |r| {
            r.kind(InteractionResponseType::ChannelMessageWithSource)
                .interaction_response_data(|d| d.content(text))
        })
        .await;
    if let Err(why) = result {
        info!("Error responding to component: {why:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_nav_ids_round_trip() {
        assert_eq!(parse_queue_nav("queue:prev:3"), Some(QueueNav::Prev(3)));
        assert_eq!(parse_queue_nav("queue:next:0"), Some(QueueNav::Next(0)));
        assert_eq!(parse_queue_nav("queue:clear"), Some(QueueNav::Clear));
        assert_eq!(parse_queue_nav("queue:prev:x"), None);
        assert_eq!(parse_queue_nav("music:skip"), None);
        assert_eq!(parse_queue_nav("queue"), None);
    }

    #[test]
    fn page_count_rounds_up_and_never_hits_zero() {
        assert_eq!(total_pages(0), 1);
        assert_eq!(total_pages(1), 1);
        assert_eq!(total_pages(QUEUE_PAGE_SIZE), 1);
        assert_eq!(total_pages(QUEUE_PAGE_SIZE + 1), 2);
        assert_eq!(total_pages(35), 4);
    }
}
