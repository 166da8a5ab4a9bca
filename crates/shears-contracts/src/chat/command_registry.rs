#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Commands whose whole remainder is kept verbatim as one argument.
pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "refine",
        action: "refine",
    },
    CommandSpec {
        command: "model",
        action: "set_model",
    },
    CommandSpec {
        command: "temperature",
        action: "set_temperature",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "save",
    action: "save_image",
}];

pub(crate) const MULTI_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "attach",
    action: "attach",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "detach",
        action: "detach",
    },
    CommandSpec {
        command: "send",
        action: "send",
    },
    CommandSpec {
        command: "regenerate",
        action: "regenerate",
    },
    CommandSpec {
        command: "clear",
        action: "clear",
    },
    CommandSpec {
        command: "history",
        action: "history",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/attach",
    "/detach",
    "/send",
    "/refine",
    "/regenerate",
    "/clear",
    "/save",
    "/history",
    "/model",
    "/temperature",
    "/help",
    "/quit",
];
