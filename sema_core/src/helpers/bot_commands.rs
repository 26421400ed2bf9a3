use teloxide::utils::command::BotCommands;

#[derive(BotCommands, Clone)]
#[command(
    rename_rule = "lowercase",
    description = "These commands are supported:"
)]
pub enum Command {
    #[command(description = "Start chatting with the bot.")]
    Start,
    #[command(description = "Display this text.")]
    Help,
    #[command(description = "Show your token balance.")]
    Balance,
    #[command(description = "Archive the current conversation and start fresh.")]
    NewChat,
    #[command(description = "Show your daily streak.")]
    Streak,
    #[command(description = "Buy tokens, e.g. /buy 500.")]
    Buy(String),
    #[command(description = "Verify a payment by reference, e.g. /verify sema-....")]
    Verify(String),
    #[command(description = "Set the email used for payment receipts.")]
    Email(String),
}
