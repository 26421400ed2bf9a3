use anyhow::Result;
use sema_core::helpers::bot_commands::Command;
use teloxide::{
    dispatching::{DpHandlerDescription, HandlerExt, UpdateFilterExt},
    dptree::{self, Handler},
    types::{Message, Update},
};

use crate::bot::{answers::answers, callbacks::handle_callback_query, handler::handle_message};

pub fn handler_tree() -> Handler<'static, Result<()>, DpHandlerDescription> {
    dptree::entry()
        .branch(
            Update::filter_message()
                .branch(
                    dptree::entry()
                        .filter_command::<Command>()
                        .endpoint(answers),
                )
                .branch(
                    // Anything else with text or a photo goes to the
                    // orchestrator as a prompt.
                    dptree::entry()
                        .filter(|msg: Message| msg.text().is_some() || msg.photo().is_some())
                        .endpoint(handle_message),
                ),
        )
        .branch(Update::filter_callback_query().endpoint(handle_callback_query))
}
