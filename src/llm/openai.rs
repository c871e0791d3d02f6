//! OpenAI 兼容引擎
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。这类端点是无状态的，
//! 会话历史在本地维护；没有原生用量测量接口，用 TokenEstimator 近似。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestMessageContentPartAudio, ChatCompletionRequestMessageContentPartImage,
    ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContentPart,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, ImageDetail, ImageUrl, InputAudio,
    InputAudioFormat,
};
use async_openai::Client;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{stream, StreamExt};

use crate::llm::{
    CreateOptions, LanguageModel, LlmError, ModelFactory, PromptInput, PromptOptions, TextStream,
};
use crate::memory::{ContentPart, Message, MessageContent, Role, TokenEstimator};

/// OpenAI 兼容会话工厂：持有 Client、模型名与配置的容量
pub struct OpenAiFactory {
    client: Client<OpenAIConfig>,
    model: String,
    input_quota: u64,
}

impl OpenAiFactory {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>, input_quota: u64) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            input_quota,
        }
    }
}

#[async_trait]
impl ModelFactory for OpenAiFactory {
    async fn create(&self, options: CreateOptions) -> Result<Arc<dyn LanguageModel>, LlmError> {
        let usage = TokenEstimator::estimate_messages(&options.initial_prompts) as u64;
        Ok(Arc::new(OpenAiModel {
            client: self.client.clone(),
            model: self.model.clone(),
            quota: self.input_quota,
            temperature: options.temperature,
            history: Arc::new(Mutex::new(options.initial_prompts)),
            usage: Arc::new(AtomicU64::new(usage)),
            destroyed: AtomicBool::new(false),
        }))
    }
}

/// OpenAI 兼容会话
pub struct OpenAiModel {
    client: Client<OpenAIConfig>,
    model: String,
    quota: u64,
    temperature: Option<f32>,
    history: Arc<Mutex<Vec<Message>>>,
    usage: Arc<AtomicU64>,
    destroyed: AtomicBool,
}

impl OpenAiModel {
    fn check(&self, options: &PromptOptions) -> Result<(), LlmError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(LlmError::Destroyed);
        }
        if options.is_aborted() {
            return Err(LlmError::Aborted);
        }
        Ok(())
    }

    /// 会话历史 + 本次输入（带输出约束时追加一段格式要求）
    fn request(&self, input: &PromptInput, options: &PromptOptions) -> Result<CreateChatCompletionRequest, LlmError> {
        let mut messages = lock(&self.history).clone();
        messages.extend(input.to_messages());
        if let Some(schema) = &options.response_constraint {
            messages.push(Message::user(format!(
                "Respond with a single JSON object that matches this JSON Schema and nothing else:\n{}",
                schema
            )));
        }
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(to_openai_messages(&messages)?);
        if let Some(t) = self.temperature {
            args.temperature(t);
        }
        args.build().map_err(|e| LlmError::Request(e.to_string()))
    }

    fn record(history: &Mutex<Vec<Message>>, usage: &AtomicU64, input: Vec<Message>, reply: String) {
        let mut h = lock(history);
        h.extend(input);
        h.push(Message::assistant(reply));
        usage.store(TokenEstimator::estimate_messages(&h) as u64, Ordering::SeqCst);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn to_openai_messages(messages: &[Message]) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
    let err = |e: async_openai::error::OpenAIError| LlmError::Request(e.to_string());
    messages
        .iter()
        .map(|m| {
            Ok(match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.text())
                        .build()
                        .map_err(err)?,
                ),
                Role::User => {
                    let mut args = ChatCompletionRequestUserMessageArgs::default();
                    match &m.content {
                        MessageContent::Parts(parts) => {
                            args.content(parts.iter().map(to_user_part).collect::<Vec<_>>())
                        }
                        MessageContent::Text(text) => args.content(text.clone()),
                    };
                    ChatCompletionRequestMessage::User(args.build().map_err(err)?)
                }
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.text())
                        .build()
                        .map_err(err)?,
                ),
            })
        })
        .collect()
}

/// 多模态片段：图片转 data URL，wav / mp3 音频转 input_audio，其余音频退化为文本描述
fn to_user_part(part: &ContentPart) -> ChatCompletionRequestUserMessageContentPart {
    match part {
        ContentPart::Image { mime, data } => ChatCompletionRequestMessageContentPartImage {
            image_url: ImageUrl {
                url: format!("data:{};base64,{}", mime, BASE64.encode(data)),
                detail: Some(ImageDetail::Auto),
            },
        }
        .into(),
        ContentPart::Audio { mime, data } => match audio_format(mime) {
            Some(format) => ChatCompletionRequestMessageContentPartAudio {
                input_audio: InputAudio {
                    data: BASE64.encode(data),
                    format,
                },
            }
            .into(),
            None => ChatCompletionRequestMessageContentPartText { text: part.render() }.into(),
        },
        ContentPart::Text { text } => ChatCompletionRequestMessageContentPartText { text: text.clone() }.into(),
    }
}

fn audio_format(mime: &str) -> Option<InputAudioFormat> {
    match mime {
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some(InputAudioFormat::Wav),
        "audio/mpeg" | "audio/mp3" => Some(InputAudioFormat::Mp3),
        _ => None,
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn prompt(&self, input: PromptInput, options: &PromptOptions) -> Result<String, LlmError> {
        self.check(options)?;
        let request = self.request(&input, options)?;
        let chat = self.client.chat();
        let call = chat.create(request);
        let response = match &options.signal {
            Some(signal) => tokio::select! {
                _ = signal.cancelled() => return Err(LlmError::Aborted),
                r = call => r,
            },
            None => call.await,
        }
        .map_err(|e| LlmError::Request(e.to_string()))?;

        let content = response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        Self::record(&self.history, &self.usage, input.to_messages(), content.clone());
        Ok(content)
    }

    async fn prompt_streaming(
        &self,
        input: PromptInput,
        options: &PromptOptions,
    ) -> Result<TextStream, LlmError> {
        self.check(options)?;
        let request = self.request(&input, options)?;
        let upstream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let acc = Arc::new(Mutex::new(String::new()));
        let acc_map = acc.clone();
        let deltas = upstream.map(move |item| match item {
            Ok(resp) => {
                let delta = resp
                    .choices
                    .first()
                    .and_then(|c| c.delta.content.clone())
                    .unwrap_or_default();
                lock(&acc_map).push_str(&delta);
                Ok(delta)
            }
            Err(e) => Err(LlmError::Stream(e.to_string())),
        });

        // 上游结束后把完整回复写入会话历史
        let history = self.history.clone();
        let usage = self.usage.clone();
        let input_messages = input.to_messages();
        let finish = stream::once(async move {
            let reply = std::mem::take(&mut *lock(&acc));
            Self::record(&history, &usage, input_messages, reply);
            None::<Result<String, LlmError>>
        })
        .filter_map(|x| async move { x });

        Ok(Box::pin(deltas.chain(finish)))
    }

    async fn append(&self, input: PromptInput, options: &PromptOptions) -> Result<(), LlmError> {
        self.check(options)?;
        let mut h = lock(&self.history);
        h.extend(input.to_messages());
        self.usage
            .store(TokenEstimator::estimate_messages(&h) as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn measure_input_usage(
        &self,
        input: &PromptInput,
        _options: &PromptOptions,
    ) -> Result<u64, LlmError> {
        Ok(TokenEstimator::estimate_messages(&input.to_messages()) as u64)
    }

    fn input_quota(&self) -> u64 {
        self.quota
    }

    fn input_usage(&self) -> u64 {
        self.usage.load(Ordering::SeqCst)
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        lock(&self.history).clear();
    }
}
