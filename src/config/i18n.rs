//! User-facing strings for the CLI and the agent loop.

/// UI messages structure
#[derive(Debug, Clone)]
pub struct Messages {
    pub thinking: &'static str,
    pub action: &'static str,
    pub starting_task: &'static str,
    pub task_completed: &'static str,
    pub task_aborted: &'static str,
    pub task_ended: &'static str,
    pub task_busy: &'static str,
    pub no_task: &'static str,
    pub paused: &'static str,
    pub resumed: &'static str,
    pub step: &'static str,
    pub result: &'static str,
    pub app_disabled: &'static str,
    pub continue_prompt: &'static str,
    /// Added to the model history when a blocked app is skipped.
    pub app_blocked_note: &'static str,
    pub empty_reply_note: &'static str,
    pub max_steps_reached: &'static str,
    pub ended_by_user: &'static str,
    pub enabled: &'static str,
    pub disabled: &'static str,
}

/// Chinese messages
pub static MESSAGES_ZH: Messages = Messages {
    thinking: "思考过程",
    action: "执行动作",
    starting_task: "开始执行任务",
    task_completed: "任务完成",
    task_aborted: "任务中止",
    task_ended: "任务异常结束",
    task_busy: "当前已有任务在运行",
    no_task: "没有任务",
    paused: "已暂停",
    resumed: "已继续",
    step: "步骤",
    result: "结果",
    app_disabled: "智能体无权操作该应用",
    continue_prompt: "是否继续当前任务？(y/n)",
    app_blocked_note: "该应用已被禁止操作，请不要再打开它，换一种方式完成任务或直接结束。",
    empty_reply_note: "上一轮没有收到你的回复，请根据当前屏幕给出下一步操作。",
    max_steps_reached: "已达到最大步数",
    ended_by_user: "用户拒绝继续",
    enabled: "已启用",
    disabled: "已禁用",
};

/// English messages
pub static MESSAGES_EN: Messages = Messages {
    thinking: "Thinking",
    action: "Action",
    starting_task: "Starting task",
    task_completed: "Task Completed",
    task_aborted: "Task Aborted",
    task_ended: "Task Ended",
    task_busy: "A task is already running",
    no_task: "No task",
    paused: "Paused",
    resumed: "Resumed",
    step: "Step",
    result: "Result",
    app_disabled: "The agent is not allowed to operate this app",
    continue_prompt: "Continue the current task? (y/n)",
    app_blocked_note: "This app is blocked. Do not open it again; find another way or finish.",
    empty_reply_note: "Your previous reply was empty. Give the next action for the current screen.",
    max_steps_reached: "Reached max steps",
    ended_by_user: "User declined to continue",
    enabled: "enabled",
    disabled: "disabled",
};

/// Get UI messages by language code, "en" for English and anything else for Chinese.
pub fn get_messages(lang: &str) -> &'static Messages {
    match lang {
        "en" => &MESSAGES_EN,
        _ => &MESSAGES_ZH,
    }
}
